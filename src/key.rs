//! Published DKIM key record parsing (RFC 6376 section 3.6.1).
//!
//! The DNS lookup itself is the caller's job (see `result::DnsEntry`); this
//! module only interprets the TXT record text once it has been fetched.

use crate::codec::decode_base64;
use crate::errors::DKIMError;
use crate::rsa_sign::decode_public_key;
use crate::tag_list::parse_unique_tag_list;
use rsa::RsaPublicKey;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct PublicKeyRecord {
    pub version: String,
    pub key_type: String,
    /// `None` means the key was published with an empty `p=`: revoked.
    pub public_key: Option<RsaPublicKey>,
    pub hashes: HashSet<String>,
    pub service_types: HashSet<String>,
    /// Lowercased flag letters from `t=`: `y` (testing), `s` (strict).
    pub flags: HashSet<char>,
}

impl PublicKeyRecord {
    pub fn is_revoked(&self) -> bool {
        self.public_key.is_none()
    }

    pub fn is_testing(&self) -> bool {
        self.flags.contains(&'y')
    }

    pub fn is_strict(&self) -> bool {
        self.flags.contains(&'s')
    }

    pub fn allows_hash(&self, name: &str) -> bool {
        self.hashes.contains(name)
    }
}

/// Parses the TXT record text published at `<selector>._domainkey.<domain>`.
pub fn parse_record(txt: &str) -> Result<PublicKeyRecord, DKIMError> {
    let tags = parse_unique_tag_list(txt)
        .map_err(|err| DKIMError::InvalidKeyRecord(err.to_string()))?;
    if tags.is_empty() {
        return Err(DKIMError::InvalidKeyRecord("empty record".into()));
    }

    let mut version = "DKIM1".to_string();
    let mut key_type = "rsa".to_string();
    let mut p_value: Option<&str> = None;
    let mut hashes: HashSet<String> = ["sha1", "sha256"].iter().map(|s| s.to_string()).collect();
    let mut service_types: HashSet<String> = ["*"].iter().map(|s| s.to_string()).collect();
    let mut flags = HashSet::new();

    for tag in &tags {
        match tag.name.as_str() {
            "v" => version = tag.value.clone(),
            "k" => key_type = tag.value.clone(),
            "p" => p_value = Some(tag.value.as_str()),
            "h" => {
                hashes = tag
                    .value
                    .split(':')
                    .map(|s| s.to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "s" => {
                service_types = tag
                    .value
                    .split(':')
                    .map(|s| s.to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "t" => {
                flags = tag
                    .value
                    .split(':')
                    .filter_map(|s| s.to_lowercase().chars().next())
                    .collect();
            }
            // "g" (deprecated granularity tag) and any other unrecognized
            // tag are dropped unconditionally.
            _ => {}
        }
    }

    if version != "DKIM1" {
        return Err(DKIMError::KeyIncompatibleVersion);
    }
    if key_type != "rsa" {
        return Err(DKIMError::InappropriateKeyAlgorithm);
    }
    if !service_types.contains("*") && !service_types.contains("email") {
        return Err(DKIMError::InappropriateKeyAlgorithm);
    }

    let public_key = match p_value {
        None => return Err(DKIMError::InvalidKeyRecord("missing p= tag".into())),
        Some(p) if p.is_empty() => None,
        Some(p) => {
            let der = decode_base64(p)?;
            Some(decode_public_key(&der)?)
        }
    };

    Ok(PublicKeyRecord {
        version,
        key_type,
        public_key,
        hashes,
        service_types,
        flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_defaults() {
        let record = parse_record(
            "v=DKIM1; p=MIGJAoGBALVI635dLK4cJJAH3Lx6upo3X/Lm1tQz3mezcWTA3BUBnyIsdnRf57aD5BtNmhPrYYDlWlzw3UgnKisIxktkk5+iMQMlFtAS10JB8L3YadXNJY+JBcbeSi5TgJe4WFzNgW95FWDAuSTRXSWZfA/8xjflbTLDx0euFZOM7C4T0GwLAgMBAAE=",
        )
        .unwrap();
        assert_eq!(record.version, "DKIM1");
        assert_eq!(record.key_type, "rsa");
        assert!(record.hashes.contains("sha1"));
        assert!(record.hashes.contains("sha256"));
        assert!(record.service_types.contains("*"));
        assert!(!record.is_revoked());
    }

    #[test]
    fn test_parse_record_revoked_empty_p() {
        let record = parse_record("v=DKIM1; k=rsa; p=").unwrap();
        assert!(record.is_revoked());
    }

    #[test]
    fn test_parse_record_rejects_garbage() {
        assert!(parse_record("And now for something completely different").is_err());
    }

    #[test]
    fn test_parse_record_testing_flag() {
        let record = parse_record("v=DKIM1; p=; t=y").unwrap();
        assert!(record.is_testing());
        assert!(!record.is_strict());
    }

    #[test]
    fn test_parse_record_service_type_rejects_non_email() {
        let err = parse_record("v=DKIM1; p=; s=web").unwrap_err();
        assert!(matches!(err, DKIMError::InappropriateKeyAlgorithm));
    }
}
