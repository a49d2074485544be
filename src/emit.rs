//! Builds a signed `DKIM-Signature:` header field from a sign-template
//! (RFC 6376 sections 3.5 and 5), reusing the engine's header-hash
//! machinery over the message's already-seen headers plus the in-progress
//! field itself.

use crate::canon::canonicalize_header;
use crate::codec::{encode_base64, encode_qp};
use crate::engine::{select_headers, HeaderField, HEADER_NAME};
use crate::errors::DKIMError;
use crate::hash::digest;
use crate::rsa_sign;
use crate::signature::{SignExpiry, SignTemplate};

/// Produces the finished `DKIM-Signature: ...` header text for `template`,
/// given the message's accumulated header fields and the signature's
/// already-computed body hash.
pub(crate) fn emit(
    template: &SignTemplate,
    fields: &[HeaderField],
    body_hash: &[u8],
    now: i64,
) -> Result<String, DKIMError> {
    let private_key = rsa_sign::decode_private_key(&template.private_key_pem)?;

    let timestamp = template.timestamp.unwrap_or(now);
    let expiration = template.expiration.map(|expiry| match expiry {
        SignExpiry::Absolute(t) => t,
        SignExpiry::RelativeSeconds(secs) => timestamp + secs,
    });

    let mut tags: Vec<(&str, String)> = vec![
        ("v", "1".to_string()),
        ("a", template.algo.algo_name().to_string()),
        (
            "c",
            format!(
                "{}/{}",
                template.header_canon.name(),
                template.body_canon.name()
            ),
        ),
        ("d", template.domain.clone()),
        ("q", "dns/txt".to_string()),
        ("s", template.selector.clone()),
        ("t", timestamp.to_string()),
    ];
    if let Some(x) = expiration {
        tags.push(("x", x.to_string()));
    }
    tags.push(("h", template.signed_headers.join(":")));
    if let Some(l) = template.body_length {
        tags.push(("l", l.to_string()));
    }
    if let Some(identity) = &template.identity {
        tags.push(("i", encode_qp(identity)));
    }
    if let Some(z) = &template.z {
        tags.push(("z", encode_qp(z)));
    }
    tags.push(("bh", encode_base64(body_hash)));

    let mut unsigned_tags = tags.clone();
    unsigned_tags.push(("b", String::new()));
    let unsigned_value = fold_header(&unsigned_tags);
    let unsigned_raw = format!("{}: {}", HEADER_NAME, unsigned_value);

    let mut input = Vec::new();
    for f in select_headers(&template.signed_headers, fields, None) {
        canonicalize_header(template.header_canon, &f.raw, &f.name, &f.value, &mut input);
    }
    let mut tail = Vec::new();
    canonicalize_header(
        template.header_canon,
        unsigned_raw.as_bytes(),
        HEADER_NAME,
        unsigned_value.as_bytes(),
        &mut tail,
    );
    while tail.ends_with(b"\r\n") {
        tail.truncate(tail.len() - 2);
    }
    input.extend_from_slice(&tail);

    let header_hash = digest(template.algo, &input);
    let signature = rsa_sign::sign(&private_key, template.algo, &header_hash)?;

    tags.push(("b", encode_base64(&signature)));
    let signed_value = fold_header(&tags);

    Ok(format!("{}: {}", HEADER_NAME, signed_value))
}

fn budget(lines: &[String]) -> usize {
    if lines.is_empty() {
        64
    } else {
        80
    }
}

/// Line-folds a tag list into the value text following `DKIM-Signature: `:
/// a 64-column budget on the first physical line, 80 columns on the rest,
/// each continuation line beginning with a single space. `h=` and `b=`
/// always start a fresh line; long values (the signature itself, or a
/// lengthy `h=` list) are hard-wrapped across as many lines as needed.
fn fold_header(tags: &[(&str, String)]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();

    for (key, value) in tags {
        let always_new_line = *key == "b" || *key == "h";
        let w = budget(&lines);
        if !line.is_empty() && (always_new_line || line.len() + key.len() + value.len() + 2 > w) {
            lines.push(std::mem::take(&mut line));
        }

        if !line.is_empty() || !lines.is_empty() {
            line.push(' ');
        }
        line.push_str(key);
        line.push('=');

        let w = budget(&lines);
        if line.len() + value.len() < w {
            line.push_str(value);
        } else if *key == "h" {
            for (idx, name) in value.split(':').enumerate() {
                if idx > 0 {
                    line.push(':');
                }
                let w = budget(&lines);
                if line.len() + name.len() < w {
                    line.push_str(name);
                    continue;
                }
                lines.push(std::mem::take(&mut line));
                line.push(' ');
                line.push_str(name);
            }
        } else {
            let mut remaining = value.as_str();
            loop {
                let w = budget(&lines);
                let room = w.saturating_sub(line.len()).max(1);
                if remaining.len() <= room {
                    line.push_str(remaining);
                    break;
                }
                let split = room.min(remaining.len());
                let (head, tail) = remaining.split_at(split);
                line.push_str(head);
                lines.push(std::mem::take(&mut line));
                line.push(' ');
                remaining = tail;
            }
        }
        line.push(';');
    }

    if !line.is_empty() {
        lines.push(line);
    }

    lines.join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_header_keeps_short_tags_on_one_line() {
        let tags: Vec<(&str, String)> = vec![
            ("v", "1".to_string()),
            ("a", "rsa-sha256".to_string()),
            ("d", "example.com".to_string()),
        ];
        let folded = fold_header(&tags);
        k9::snapshot!(folded, "v=1; a=rsa-sha256; d=example.com;");
    }

    #[test]
    fn test_fold_header_always_breaks_before_h_and_b() {
        let tags: Vec<(&str, String)> = vec![
            ("v", "1".to_string()),
            ("h", "from:subject".to_string()),
            ("b", "AAAA".to_string()),
        ];
        let folded = fold_header(&tags);
        k9::snapshot!(folded, "v=1;\r\n h=from:subject;\r\n b=AAAA;");
    }

    #[test]
    fn test_fold_header_wraps_long_signature_value() {
        let long_b = "A".repeat(200);
        let tags: Vec<(&str, String)> = vec![("v", "1".to_string()), ("b", long_b.clone())];
        let folded = fold_header(&tags);
        let expected = format!(
            "v=1;\r\n b={}\r\n {}\r\n {};",
            &long_b[..77],
            &long_b[77..156],
            &long_b[156..200]
        );
        k9::snapshot!(folded, expected);
    }
}
