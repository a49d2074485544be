//! Header and body canonicalization (RFC 6376 section 3.4).
//!
//! Header canonicalization operates on one fully-buffered field at a time.
//! Body canonicalization is streaming: [`BodyCanonicalizer`] is fed chunks
//! as they arrive and holds just enough state (a run of not-yet-emitted
//! empty lines, plus any unterminated trailing fragment) to reproduce the
//! same digest a whole-buffer implementation would produce.

use crate::hash::{HashAlgo, LimitHasher};
use memchr::memmem::Finder;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Canon {
    Simple,
    Relaxed,
}

impl Canon {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Relaxed => "relaxed",
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc6376#section-3.4.1
//
// Simple header canonicalization is a pure passthrough of the field as it
// appeared on the wire; `raw_field` is expected to already be the complete
// "Name: value" text (folding and all), so this just makes sure it ends in
// exactly one CRLF.
pub(crate) fn canonicalize_header_simple(raw_field: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(raw_field);
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
}

// https://datatracker.ietf.org/doc/html/rfc6376#section-3.4.2
pub(crate) fn canonicalize_header_relaxed(name: &str, value: &[u8], out: &mut Vec<u8>) {
    let name = name.to_lowercase();
    let name = name.trim_end();

    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b":");

    let value = trim_ws_start(trim_ws_end(value));
    let mut space_run = false;
    for &c in value {
        match c {
            b'\r' | b'\n' => {}
            b' ' | b'\t' => {
                if space_run {
                    continue;
                }
                space_run = true;
                out.push(b' ');
            }
            _ => {
                space_run = false;
                out.push(c);
            }
        }
    }

    out.extend_from_slice(b"\r\n");
}

pub(crate) fn canonicalize_header(
    kind: Canon,
    raw_field: &[u8],
    name: &str,
    value: &[u8],
    out: &mut Vec<u8>,
) {
    match kind {
        Canon::Simple => canonicalize_header_simple(raw_field, out),
        Canon::Relaxed => canonicalize_header_relaxed(name, value, out),
    }
}

fn trim_ws_start(mut line: &[u8]) -> &[u8] {
    while let Some(c) = line.first() {
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => line = &line[1..],
            _ => break,
        }
    }
    line
}

fn trim_ws_end(mut line: &[u8]) -> &[u8] {
    while let Some(c) = line.last() {
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => line = &line[..line.len() - 1],
            _ => break,
        }
    }
    line
}

/// A streaming body canonicalizer: one instance per signature's body hash
/// pipeline. Feed it raw message-body chunks in order with [`feed`], then
/// call [`finish`] once to obtain the base64 body hash.
///
/// [`feed`]: BodyCanonicalizer::feed
/// [`finish`]: BodyCanonicalizer::finish
pub(crate) struct BodyCanonicalizer {
    kind: Canon,
    hasher: LimitHasher,
    /// Bytes observed since the last complete `\r\n`-terminated line, with
    /// bare `\n` already normalized to `\r\n` (see `pending_cr`).
    buf: Vec<u8>,
    /// True if the byte most recently appended to `buf` was a lone `\r`
    /// whose partner `\n` may arrive in the next chunk.
    pending_cr: bool,
    /// Count of buffered, not-yet-emitted empty lines awaiting either a
    /// flush (more content follows) or discard (end of body).
    empty_run: usize,
    /// Whether any non-empty line (or non-empty trailing fragment) has
    /// been emitted yet.
    emitted_content: bool,
    /// Whether `feed` has ever been called with a non-empty slice.
    saw_bytes: bool,
}

impl BodyCanonicalizer {
    pub fn new(kind: Canon, algo: HashAlgo, limit: Option<usize>) -> Self {
        BodyCanonicalizer {
            kind,
            hasher: LimitHasher::new(algo, limit),
            buf: Vec::new(),
            pending_cr: false,
            empty_run: 0,
            emitted_content: false,
            saw_bytes: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.saw_bytes = true;

        for &b in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if b == b'\n' {
                    self.buf.push(b'\n');
                    self.drain_lines();
                    continue;
                }
                // The prior lone \r was not part of a CRLF; normalize it on
                // its own before handling the current byte.
                self.buf.push(b'\n');
                self.drain_lines();
            }
            match b {
                b'\r' => self.pending_cr = true,
                b'\n' => {
                    self.buf.push(b'\r');
                    self.buf.push(b'\n');
                    self.drain_lines();
                }
                _ => self.buf.push(b),
            }
        }
    }

    /// Extracts every complete `\r\n`-terminated line currently sitting at
    /// the front of `buf`, leaving only an unterminated remainder behind.
    fn drain_lines(&mut self) {
        static CRLF: std::sync::OnceLock<Finder> = std::sync::OnceLock::new();
        let finder = CRLF.get_or_init(|| Finder::new("\r\n"));

        let mut start = 0;
        while let Some(idx) = finder.find(&self.buf[start..]) {
            let line_end = start + idx;
            let line = self.buf[start..line_end].to_vec();
            self.handle_line(&line);
            start = line_end + 2;
        }
        self.buf.drain(0..start);
    }

    fn handle_line(&mut self, line: &[u8]) {
        if line.is_empty() {
            self.empty_run += 1;
            return;
        }
        self.flush_empty_run();
        self.emit_line(line);
    }

    fn flush_empty_run(&mut self) {
        for _ in 0..self.empty_run {
            self.hasher.hash(b"\r\n");
        }
        self.empty_run = 0;
    }

    fn emit_line(&mut self, line: &[u8]) {
        self.emitted_content = true;
        match self.kind {
            Canon::Simple => {
                self.hasher.hash(line);
                self.hasher.hash(b"\r\n");
            }
            Canon::Relaxed => {
                let line = trim_ws_end(line);
                let mut prior = 0;
                for idx in memchr::memchr2_iter(b' ', b'\t', line) {
                    if prior > 0 && idx == prior {
                        prior = idx + 1;
                        continue;
                    }
                    self.hasher.hash(&line[prior..idx]);
                    self.hasher.hash(b" ");
                    prior = idx + 1;
                }
                self.hasher.hash(&line[prior..]);
                self.hasher.hash(b"\r\n");
            }
        }
    }

    /// Finalizes the pipeline (no trailing `\r\n` remains to normalize
    /// across a chunk boundary — a lone trailing `\r` is flushed as its
    /// own byte) and returns the raw digest bytes.
    pub fn finish(mut self) -> Vec<u8> {
        if self.pending_cr {
            self.buf.push(b'\r');
            self.pending_cr = false;
        }

        if !self.buf.is_empty() {
            // Unterminated trailing fragment: the body did not end on a
            // newline boundary. Both canonicalizations treat it as a line
            // needing its own trailing CRLF.
            self.flush_empty_run();
            let tail = std::mem::take(&mut self.buf);
            self.emitted_content = true;
            match self.kind {
                Canon::Simple => {
                    self.hasher.hash(&tail);
                    self.hasher.hash(b"\r\n");
                }
                Canon::Relaxed => {
                    let line = trim_ws_end(&tail);
                    let mut prior = 0;
                    for idx in memchr::memchr2_iter(b' ', b'\t', line) {
                        if prior > 0 && idx == prior {
                            prior = idx + 1;
                            continue;
                        }
                        self.hasher.hash(&line[prior..idx]);
                        self.hasher.hash(b" ");
                        prior = idx + 1;
                    }
                    self.hasher.hash(&line[prior..]);
                    self.hasher.hash(b"\r\n");
                }
            }
        } else if !self.emitted_content {
            // The whole body (if any bytes were seen at all) consisted of
            // empty lines only. `simple` always ends with exactly one
            // CRLF; `relaxed` does too, unless the body was truly empty.
            match self.kind {
                Canon::Simple => self.hasher.hash(b"\r\n"),
                Canon::Relaxed => {
                    if self.saw_bytes {
                        self.hasher.hash(b"\r\n");
                    }
                }
            }
        }
        // else: trailing empty_run, if any, is discarded here by doing
        // nothing with it.

        self.hasher.finalize_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relaxed_header(name: &str, value: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        canonicalize_header_relaxed(name, value, &mut out);
        out
    }

    #[test]
    fn test_canonicalize_header_relaxed() {
        assert_eq!(relaxed_header("SUBJect", b" AbC\r\n"), b"subject:AbC\r\n");
        assert_eq!(
            relaxed_header("Subject \t", b"\t Your Name\t \r\n"),
            b"subject:Your Name\r\n"
        );
        assert_eq!(
            relaxed_header("Subject \t", b"\t Kimi \t \r\n No \t\r\n Na Wa\r\n"),
            b"subject:Kimi No Na Wa\r\n"
        );
    }

    #[test]
    fn test_canonicalize_header_simple_passthrough() {
        let mut out = vec![];
        canonicalize_header_simple(b"Subject: AbC\r\n", &mut out);
        assert_eq!(out, b"Subject: AbC\r\n");
    }

    #[test]
    fn test_canonicalize_header_simple_adds_missing_crlf() {
        let mut out = vec![];
        canonicalize_header_simple(b"Subject: AbC", &mut out);
        assert_eq!(out, b"Subject: AbC\r\n");
    }

    fn body_hash(kind: Canon, chunks: &[&[u8]]) -> Vec<u8> {
        let mut pipeline = BodyCanonicalizer::new(kind, HashAlgo::RsaSha256, None);
        for chunk in chunks {
            pipeline.feed(chunk);
        }
        pipeline.finish()
    }

    fn digest(bytes: &[u8]) -> Vec<u8> {
        crate::hash::digest(HashAlgo::RsaSha256, bytes)
    }

    #[test]
    fn test_body_simple_empty() {
        assert_eq!(body_hash(Canon::Simple, &[]), digest(b"\r\n"));
    }

    #[test]
    fn test_body_relaxed_empty() {
        assert_eq!(body_hash(Canon::Relaxed, &[]), digest(b""));
    }

    #[test]
    fn test_body_simple_all_blank_lines_collapse_to_one_crlf() {
        assert_eq!(
            body_hash(Canon::Simple, &[b"\r\n\r\n\r\n"]),
            digest(b"\r\n")
        );
    }

    #[test]
    fn test_body_relaxed_all_blank_lines_collapse_to_one_crlf() {
        assert_eq!(
            body_hash(Canon::Relaxed, &[b"\r\n\r\n\r\n"]),
            digest(b"\r\n")
        );
    }

    #[test]
    fn test_body_simple_trims_trailing_blank_run_preserves_middle() {
        assert_eq!(
            body_hash(Canon::Simple, &[b"a\r\n\r\nb\r\n\r\n\r\n"]),
            digest(b"a\r\n\r\nb\r\n")
        );
    }

    #[test]
    fn test_body_relaxed_whitespace_collapse() {
        assert_eq!(
            body_hash(Canon::Relaxed, &[b" C \r\nD \t E\r\n\r\n\r\n"]),
            digest(b" C\r\nD E\r\n")
        );
    }

    #[test]
    fn test_body_chunk_boundary_mid_crlf() {
        // split a "\r\n" pair across two feed() calls
        let mut pipeline = BodyCanonicalizer::new(Canon::Relaxed, HashAlgo::RsaSha256, None);
        pipeline.feed(b"hey\r");
        pipeline.feed(b"\nthere\r\n");
        assert_eq!(pipeline.finish(), digest(b"hey\r\nthere\r\n"));
    }

    #[test]
    fn test_body_chunk_boundary_mid_word() {
        let mut pipeline = BodyCanonicalizer::new(Canon::Simple, HashAlgo::RsaSha256, None);
        pipeline.feed(b"he");
        pipeline.feed(b"llo\r\n");
        assert_eq!(pipeline.finish(), digest(b"hello\r\n"));
    }

    #[test]
    fn test_body_bare_lf_normalized() {
        assert_eq!(
            body_hash(Canon::Simple, &[b"a\nb\n"]),
            digest(b"a\r\nb\r\n")
        );
    }

    #[test]
    fn test_body_simple_unterminated_final_line_gets_crlf() {
        assert_eq!(body_hash(Canon::Simple, &[b"abc"]), digest(b"abc\r\n"));
    }

    #[test]
    fn test_body_relaxed_unterminated_final_line_gets_crlf() {
        assert_eq!(body_hash(Canon::Relaxed, &[b"abc"]), digest(b"abc\r\n"));
    }

    #[test]
    fn test_l_tag_truncates_hash_input() {
        let mut pipeline = BodyCanonicalizer::new(Canon::Simple, HashAlgo::RsaSha256, Some(3));
        pipeline.feed(b"hello world\r\n");
        assert_eq!(pipeline.finish(), digest(b"hel"));
    }
}
