//! The iterative, non-blocking verification/signing engine (SPEC_FULL.md
//! section 4.9): the caller pushes message bytes with [`Engine::append`] and
//! injects DNS answers with [`Engine::result`]. The engine never performs
//! I/O of its own; it only ever reacts to what the caller hands it.

use crate::canon::{canonicalize_header, BodyCanonicalizer, Canon};
use crate::errors::DKIMError;
use crate::hash::HashAlgo;
use crate::key;
use crate::result::{verify_against_key, DnsAnswer, DnsEntry, ResultRecord, VerifyStatus};
use crate::signature::{Signature, SignTemplate};
use crate::{emit, hash};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub(crate) const HEADER_NAME: &str = "DKIM-Signature";

/// One physical header field, reassembled from its (possibly folded)
/// lines exactly as they appeared on the wire.
#[derive(Debug, Clone)]
pub(crate) struct HeaderField {
    pub(crate) name: String,
    /// The complete field text, including the name and colon, with a
    /// single trailing `\r\n` and all original folding intact.
    pub(crate) raw: Vec<u8>,
    /// Everything after the first colon, folding intact, no trailing CRLF.
    pub(crate) value: Vec<u8>,
}

/// Builds an [`Engine`]. Mirrors the teacher's fluent construction style,
/// generalized to the iterative engine's wider knob set (DNS cache, sign
/// templates, logger).
pub struct EngineBuilder {
    dns: Rc<RefCell<HashMap<String, DnsEntry>>>,
    sign_templates: Vec<SignTemplate>,
    sign_and_verify: bool,
    logger: slog::Logger,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            dns: Rc::new(RefCell::new(HashMap::new())),
            sign_templates: Vec::new(),
            sign_and_verify: false,
            logger: slog::Logger::root(slog::Discard, slog::o!()),
        }
    }

    /// Pre-seeds the DNS cache with an answer for `name`, as if a prior
    /// lookup for it had already completed.
    pub fn with_dns_answer(self, name: impl Into<String>, answer: DnsAnswer) -> Self {
        self.dns
            .borrow_mut()
            .insert(name.into().to_lowercase(), answer.into());
        self
    }

    /// Shares an existing DNS cache (e.g. one populated by a sibling
    /// engine verifying the same message) instead of starting empty.
    pub fn with_shared_dns_cache(mut self, cache: Rc<RefCell<HashMap<String, DnsEntry>>>) -> Self {
        self.dns = cache;
        self
    }

    pub fn with_sign_template(mut self, template: SignTemplate) -> Self {
        self.sign_templates.push(template);
        self
    }

    /// When set, pre-existing `DKIM-Signature:` fields in the message are
    /// also verified while signing. Otherwise they are ignored on the sign
    /// path, matching the data model's `sign_and_verify` flag.
    pub fn sign_and_verify(mut self, value: bool) -> Self {
        self.sign_and_verify = value;
        self
    }

    pub fn with_logger(mut self, logger: slog::Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            logger: self.logger,
            dns: self.dns,
            sign_and_verify: self.sign_and_verify,
            had_sign_templates: !self.sign_templates.is_empty(),
            sign_templates: self.sign_templates,
            normalizer: LineNormalizer::default(),
            header_buf: Vec::new(),
            header_done: false,
            fields: Vec::new(),
            verify_entries: Vec::new(),
            sign_state: Vec::new(),
            body_done: false,
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum VerifyEntry {
    Parsed {
        signature: Signature,
        header_hash: Vec<u8>,
        pipeline: Option<BodyCanonicalizer>,
        body_hash: Option<Vec<u8>>,
    },
    Unparsed {
        status: VerifyStatus,
        error: String,
    },
}

struct SignState {
    template: SignTemplate,
    pipeline: Option<BodyCanonicalizer>,
    body_hash: Option<Vec<u8>>,
    result: Option<Result<String, DKIMError>>,
}

/// The streaming verification/signing engine. One instance handles one
/// message from its first byte to its last.
pub struct Engine {
    logger: slog::Logger,
    dns: Rc<RefCell<HashMap<String, DnsEntry>>>,
    sign_templates: Vec<SignTemplate>,
    had_sign_templates: bool,
    sign_and_verify: bool,

    normalizer: LineNormalizer,
    header_buf: Vec<u8>,
    header_done: bool,
    fields: Vec<HeaderField>,
    verify_entries: Vec<VerifyEntry>,
    sign_state: Vec<SignState>,
    body_done: bool,
}

impl Engine {
    /// Feeds the next chunk of raw message bytes. Call with an empty slice
    /// to signal "no more bytes" (end of body). Returns the current result
    /// list once the body is complete, otherwise `None`.
    pub fn append(&mut self, bytes: &[u8]) -> Option<Vec<ResultRecord>> {
        if bytes.is_empty() {
            self.body_done = true;
            if !self.header_done {
                // No blank line was ever seen: treat whatever was buffered
                // as the entire header, with an empty body.
                let header_bytes = std::mem::take(&mut self.header_buf);
                self.header_done = true;
                self.freeze_header(&header_bytes);
            }
            self.finalize();
            return Some(self.collect_results());
        }

        let mut normalized = Vec::new();
        self.normalizer.push(bytes, &mut normalized);

        if !self.header_done {
            self.header_buf.extend_from_slice(&normalized);
            if let Some(idx) = memchr::memmem::find(&self.header_buf, b"\r\n\r\n") {
                let header_bytes = self.header_buf[..idx + 2].to_vec();
                let body_start = self.header_buf[idx + 4..].to_vec();
                self.header_buf.clear();
                self.header_done = true;
                self.freeze_header(&header_bytes);
                if !body_start.is_empty() {
                    self.feed_body(&body_start);
                }
            }
        } else {
            self.feed_body(&normalized);
        }

        None
    }

    /// Merges newly available DNS answers into the shared cache and
    /// recomputes every signature's outcome. Idempotent: safe to call
    /// repeatedly, with or without new answers, without re-reading the
    /// message.
    pub fn result<I>(&mut self, answers: I) -> Vec<ResultRecord>
    where
        I: IntoIterator<Item = (String, DnsAnswer)>,
    {
        {
            let mut dns = self.dns.borrow_mut();
            for (name, answer) in answers {
                dns.insert(name.to_lowercase(), answer.into());
            }
        }
        self.collect_results()
    }

    fn feed_body(&mut self, chunk: &[u8]) {
        for entry in &mut self.verify_entries {
            if let VerifyEntry::Parsed { pipeline, .. } = entry {
                if let Some(p) = pipeline {
                    p.feed(chunk);
                }
            }
        }
        for state in &mut self.sign_state {
            if let Some(p) = &mut state.pipeline {
                p.feed(chunk);
            }
        }
    }

    fn freeze_header(&mut self, header_bytes: &[u8]) {
        self.fields = parse_fields(header_bytes);

        let discover_verify = !self.had_sign_templates || self.sign_and_verify;
        if discover_verify {
            for idx in 0..self.fields.len() {
                if !self.fields[idx].name.eq_ignore_ascii_case(HEADER_NAME) {
                    continue;
                }
                let entry = match std::str::from_utf8(&self.fields[idx].value) {
                    Err(_) => VerifyEntry::Unparsed {
                        status: VerifyStatus::InvalidHeader,
                        error: "signature field is not valid text".to_string(),
                    },
                    Ok(value_text) => match Signature::parse(value_text) {
                        Ok(sig) => {
                            let header_hash = compute_header_hash(&self.fields, &sig, idx);
                            let pipeline =
                                BodyCanonicalizer::new(sig.body_canon, sig.algo, sig.body_length);
                            slog::debug!(
                                self.logger,
                                "discovered signature";
                                "domain" => sig.domain.clone(),
                                "selector" => sig.selector.clone(),
                            );
                            VerifyEntry::Parsed {
                                signature: sig,
                                header_hash,
                                pipeline: Some(pipeline),
                                body_hash: None,
                            }
                        }
                        Err(err) => VerifyEntry::Unparsed {
                            status: VerifyStatus::from(err.status()),
                            error: err.to_string(),
                        },
                    },
                };
                self.verify_entries.push(entry);
            }
        }

        for template in std::mem::take(&mut self.sign_templates) {
            let pipeline =
                BodyCanonicalizer::new(template.body_canon, template.algo, template.body_length);
            self.sign_state.push(SignState {
                template,
                pipeline: Some(pipeline),
                body_hash: None,
                result: None,
            });
        }
    }

    fn finalize(&mut self) {
        for entry in &mut self.verify_entries {
            if let VerifyEntry::Parsed {
                pipeline,
                body_hash,
                ..
            } = entry
            {
                if let Some(p) = pipeline.take() {
                    *body_hash = Some(p.finish());
                }
            }
        }

        for state in &mut self.sign_state {
            if state.result.is_some() {
                continue;
            }
            if let Some(p) = state.pipeline.take() {
                state.body_hash = Some(p.finish());
            }
            let body_hash = state.body_hash.clone().unwrap_or_default();
            let now = current_timestamp();
            state.result = Some(emit::emit(&state.template, &self.fields, &body_hash, now));
        }
    }

    fn collect_results(&mut self) -> Vec<ResultRecord> {
        let mut out = Vec::with_capacity(self.verify_entries.len() + self.sign_state.len());

        for entry in &self.verify_entries {
            match entry {
                VerifyEntry::Unparsed { status, error } => {
                    out.push(ResultRecord::Unparsed {
                        status: *status,
                        error: error.clone(),
                    });
                }
                VerifyEntry::Parsed {
                    signature,
                    header_hash,
                    body_hash,
                    ..
                } => {
                    let dns_name = signature.dns_name();
                    let (status, error) = match body_hash {
                        None => (None, None),
                        Some(body_hash) => resolve_verify(
                            &self.dns,
                            signature,
                            body_hash,
                            header_hash,
                        ),
                    };
                    out.push(ResultRecord::Verify {
                        signature: Box::new(signature.clone()),
                        dns_name,
                        status,
                        error,
                    });
                }
            }
        }

        for state in &self.sign_state {
            let record = match &state.result {
                None => continue,
                Some(Ok(header)) => ResultRecord::Sign {
                    domain: state.template.domain.clone(),
                    selector: state.template.selector.clone(),
                    status: VerifyStatus::Valid,
                    error: None,
                    header: Some(header.clone()),
                },
                Some(Err(err)) => ResultRecord::Sign {
                    domain: state.template.domain.clone(),
                    selector: state.template.selector.clone(),
                    status: VerifyStatus::from(err.status()),
                    error: Some(err.to_string()),
                    header: None,
                },
            };
            out.push(record);
        }

        out
    }
}

fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Runs the DNS-lookup state machine (SPEC_FULL.md section 4.10) for one
/// signature against the shared cache, resolving, caching, and reporting
/// its outcome.
fn resolve_verify(
    dns: &Rc<RefCell<HashMap<String, DnsEntry>>>,
    sig: &Signature,
    computed_body_hash: &[u8],
    computed_header_hash: &[u8],
) -> (Option<VerifyStatus>, Option<String>) {
    if let Some(x) = sig.expiration {
        if x < current_timestamp() {
            return (
                Some(VerifyStatus::SoftFail),
                Some("signature expired".to_string()),
            );
        }
    }

    let name = sig.dns_name().to_lowercase();
    let mut dns = dns.borrow_mut();
    let entry = dns.entry(name).or_insert(DnsEntry::Absent);

    match entry {
        DnsEntry::Absent => (None, None),
        DnsEntry::LookupFailed => (
            Some(VerifyStatus::TempFail),
            Some("dns lookup failed".to_string()),
        ),
        DnsEntry::Permfail(reason) => (Some(VerifyStatus::PermFail), Some(reason.clone())),
        DnsEntry::Unresolved(raw) => {
            let mut parsed = None;
            for txt in raw.iter() {
                if let Ok(record) = key::parse_record(txt) {
                    parsed = Some(record);
                    break;
                }
            }
            match parsed {
                Some(record) => {
                    let record = Rc::new(record);
                    *entry = DnsEntry::Parsed(Rc::clone(&record));
                    let (status, error) = verify_against_key(
                        sig,
                        &record,
                        computed_body_hash,
                        computed_header_hash,
                    );
                    (Some(status), error)
                }
                None => {
                    let reason = "invalid or empty DKIM record".to_string();
                    *entry = DnsEntry::Permfail(reason.clone());
                    (Some(VerifyStatus::PermFail), Some(reason))
                }
            }
        }
        DnsEntry::Parsed(record) => {
            let (status, error) =
                verify_against_key(sig, record, computed_body_hash, computed_header_hash);
            (Some(status), error)
        }
    }
}

/// Carries line-ending normalization state (a bare `\n` becomes `\r\n`, a
/// lone trailing `\r` waits for its possible `\n` partner) across `append`
/// calls, so the header splitter downstream only ever sees CRLF-terminated
/// lines regardless of how the caller chunked the input.
#[derive(Default)]
struct LineNormalizer {
    pending_cr: bool,
}

impl LineNormalizer {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &b in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if b == b'\n' {
                    out.push(b'\r');
                    out.push(b'\n');
                    continue;
                }
                out.push(b'\r');
                out.push(b'\n');
            }
            match b {
                b'\r' => self.pending_cr = true,
                b'\n' => {
                    out.push(b'\r');
                    out.push(b'\n');
                }
                _ => out.push(b),
            }
        }
    }
}

fn split_lines(buf: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    while let Some(idx) = memchr::memmem::find(&buf[start..], b"\r\n") {
        lines.push(&buf[start..start + idx]);
        start += idx + 2;
    }
    if start < buf.len() {
        lines.push(&buf[start..]);
    }
    lines
}

fn flush_field<'a>(current: &mut Vec<&'a [u8]>, fields: &mut Vec<HeaderField>) {
    if current.is_empty() {
        return;
    }
    let colon = current[0]
        .iter()
        .position(|&b| b == b':')
        .unwrap_or(current[0].len());
    let name = String::from_utf8_lossy(&current[0][..colon]).into_owned();

    let mut raw = Vec::new();
    let mut value = Vec::new();
    if colon < current[0].len() {
        value.extend_from_slice(&current[0][colon + 1..]);
    }
    for (i, line) in current.iter().enumerate() {
        if i > 0 {
            raw.extend_from_slice(b"\r\n");
            value.extend_from_slice(b"\r\n");
            value.extend_from_slice(line);
        }
        raw.extend_from_slice(line);
    }
    raw.extend_from_slice(b"\r\n");

    fields.push(HeaderField { name, raw, value });
    current.clear();
}

/// Splits a frozen header byte range into physical fields, joining folded
/// continuation lines (those starting with SP or TAB) onto the field they
/// continue.
fn parse_fields(header_bytes: &[u8]) -> Vec<HeaderField> {
    let lines = split_lines(header_bytes);
    let mut fields = Vec::new();
    let mut current: Vec<&[u8]> = Vec::new();

    for line in lines {
        let is_continuation = matches!(line.first(), Some(b' ') | Some(b'\t'));
        if is_continuation && !current.is_empty() {
            current.push(line);
        } else {
            flush_field(&mut current, &mut fields);
            current.push(line);
        }
    }
    flush_field(&mut current, &mut fields);

    fields
}

/// Selects the fields a signature's `h=` list names, bottom-up: for each
/// name in order, the lowest not-yet-consumed matching field from the end
/// of the header is chosen, so repeated names pick successively earlier
/// occurrences (RFC 6376 section 5.4.2). `exclude_idx`, when given, is a
/// field index that never counts as a match — used to keep a signature's
/// own `DKIM-Signature:` field out of its own `h=` selection.
pub(crate) fn select_headers<'a>(
    h_list: &[String],
    fields: &'a [HeaderField],
    exclude_idx: Option<usize>,
) -> Vec<&'a HeaderField> {
    let mut selected = Vec::new();
    let num = fields.len();
    let mut last_index: HashMap<&str, usize> = HashMap::new();

    for name in h_list {
        let start = *last_index.get(name.as_str()).unwrap_or(&num);
        let mut found = false;
        for i in (0..start).rev() {
            if Some(i) == exclude_idx {
                continue;
            }
            if fields[i].name.eq_ignore_ascii_case(name) {
                selected.push(&fields[i]);
                last_index.insert(name.as_str(), i);
                found = true;
                break;
            }
        }
        if !found {
            last_index.insert(name.as_str(), 0);
        }
    }

    selected
}

fn erase_b_bytes(field_bytes: &[u8], raw_b_value: &str) -> Vec<u8> {
    let needle = raw_b_value.as_bytes();
    if needle.is_empty() {
        return field_bytes.to_vec();
    }
    match memchr::memmem::find(field_bytes, needle) {
        Some(pos) => {
            let mut out = Vec::with_capacity(field_bytes.len() - needle.len());
            out.extend_from_slice(&field_bytes[..pos]);
            out.extend_from_slice(&field_bytes[pos + needle.len()..]);
            out
        }
        None => field_bytes.to_vec(),
    }
}

/// Computes a signature's header hash (RFC 6376 section 3.7): the selected
/// headers it claims to sign, canonicalized in order, followed by its own
/// `DKIM-Signature:` field canonicalized with the `b=` value erased and no
/// trailing CRLF.
fn compute_header_hash(fields: &[HeaderField], sig: &Signature, sig_field_idx: usize) -> Vec<u8> {
    let mut input = Vec::new();
    for f in select_headers(&sig.signed_headers, fields, Some(sig_field_idx)) {
        canonicalize_header(sig.header_canon, &f.raw, &f.name, &f.value, &mut input);
    }

    let s_field = &fields[sig_field_idx];
    let erased_raw = erase_b_bytes(&s_field.raw, &sig.raw_b_value);
    let erased_value = erase_b_bytes(&s_field.value, &sig.raw_b_value);
    let mut tail = Vec::new();
    canonicalize_header(
        sig.header_canon,
        &erased_raw,
        &s_field.name,
        &erased_value,
        &mut tail,
    );
    while tail.ends_with(b"\r\n") {
        tail.truncate(tail.len() - 2);
    }
    input.extend_from_slice(&tail);

    hash::digest(sig.algo, &input)
}
