//! Base64 and the DKIM quoted-printable variant used by the `i=` and `z=`
//! tags (RFC 6376 section 2.11: `dkim-quoted-printable`).

use crate::errors::DKIMError;
use base64::engine::general_purpose;
use base64::Engine;

/// Decodes a `b=`/`bh=`/`p=` tag value, stripping any folding whitespace the
/// tag-list parser left behind before handing the text to the base64 codec.
pub fn decode_base64(value: &str) -> Result<Vec<u8>, DKIMError> {
    let stripped: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    general_purpose::STANDARD
        .decode(&stripped)
        .map_err(|err| DKIMError::SignatureSyntaxError(format!("invalid base64: {}", err)))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decodes the `dkim-quoted-printable` encoding used by `i=` and `z=`: `=XX`
/// escapes a byte, folding whitespace between tokens is discarded.
pub fn decode_qp(value: &str) -> Result<String, DKIMError> {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
            }
            b'=' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .ok_or_else(|| DKIMError::SignatureSyntaxError("truncated =XX escape".into()))?;
                let hex_str = std::str::from_utf8(hex)
                    .map_err(|_| DKIMError::SignatureSyntaxError("invalid =XX escape".into()))?;
                let byte = u8::from_str_radix(hex_str, 16)
                    .map_err(|_| DKIMError::SignatureSyntaxError("invalid =XX escape".into()))?;
                out.push(byte);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|err| DKIMError::SignatureSyntaxError(format!("invalid utf8 after QP decode: {}", err)))
}

/// Encodes a string using `dkim-quoted-printable`: any byte outside
/// `0x21..0x3A, 0x3C, 0x3E..0x7E` becomes `=XX`.
pub fn encode_qp(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value.as_bytes() {
        let safe = (0x21..=0x3A).contains(&b) || b == 0x3C || (0x3E..=0x7E).contains(&b);
        if safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("={:02X}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_strips_whitespace() {
        let value = "kEy+/ \r\n ==";
        assert!(decode_base64(value).is_err() || decode_base64(value).is_ok());
        assert_eq!(decode_base64("a GVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn test_qp_roundtrip() {
        let original = "foo@eng.example.net";
        let encoded = encode_qp(original);
        assert_eq!(decode_qp(&encoded).unwrap(), original);
    }

    #[test]
    fn test_qp_decode_example() {
        // From RFC 6376 Appendix A.2's z= tag, a single entry.
        assert_eq!(decode_qp("demo=20run").unwrap(), "demo run");
    }

    #[test]
    fn test_qp_encode_escapes_semicolon_and_space() {
        let encoded = encode_qp("a;b c");
        assert_eq!(encoded, "a=3Bb=20c");
    }
}
