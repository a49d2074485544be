//! Per-signature outcomes and the DNS-record polymorphism the engine's
//! caller-driven lookup protocol needs (SPEC_FULL.md section 4.10, section
//! 9 "DNS-record polymorphism").

use crate::key::PublicKeyRecord;
use crate::signature::Signature;
use std::rc::Rc;

/// The five-way outcome bucket a result record settles into. Mirrors the
/// teacher's three-state `DKIMVerificationStatus`, generalized with the
/// `InvalidHeader` bucket for signatures that never reach crypto, and
/// carrying the stable numeric codes external callers key off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Valid,
    SoftFail,
    TempFail,
    PermFail,
    InvalidHeader,
}

impl VerifyStatus {
    pub fn code(&self) -> i8 {
        match self {
            Self::Valid => 1,
            Self::TempFail => -1,
            Self::SoftFail => -2,
            Self::InvalidHeader => -3,
            Self::PermFail => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::SoftFail => "soft-fail",
            Self::TempFail => "temp-fail",
            Self::PermFail => "perm-fail",
            Self::InvalidHeader => "invalid-header",
        }
    }
}

impl From<crate::errors::Status> for VerifyStatus {
    fn from(status: crate::errors::Status) -> Self {
        match status {
            crate::errors::Status::InvalidHeader => VerifyStatus::InvalidHeader,
            crate::errors::Status::SoftFail => VerifyStatus::SoftFail,
            crate::errors::Status::TempFail => VerifyStatus::TempFail,
            crate::errors::Status::PermFail => VerifyStatus::PermFail,
        }
    }
}

/// What the DNS map holds for a given `<selector>._domainkey.<domain>`
/// name, at any point between "never looked up" and "parsed and cached."
#[derive(Debug, Clone)]
pub enum DnsEntry {
    /// No lookup has been attempted (and no caller-supplied answer exists).
    Absent,
    /// One or more raw TXT record strings, not yet parsed as a key record.
    Unresolved(Vec<String>),
    /// Successfully parsed and validated; cached so later signatures
    /// sharing this name skip re-parsing.
    Parsed(Rc<PublicKeyRecord>),
    /// The caller's lookup explicitly failed (transient).
    LookupFailed,
    /// TXT text existed but failed to parse as a key record.
    Permfail(String),
}

/// What a caller may hand the engine for a DNS name: either the answer to
/// a lookup, or an explicit signal that the lookup failed.
#[derive(Debug, Clone)]
pub enum DnsAnswer {
    Txt(String),
    TxtRecords(Vec<String>),
    LookupFailed,
}

impl From<DnsAnswer> for DnsEntry {
    fn from(answer: DnsAnswer) -> Self {
        match answer {
            DnsAnswer::Txt(s) => DnsEntry::Unresolved(vec![s]),
            DnsAnswer::TxtRecords(v) => DnsEntry::Unresolved(v),
            DnsAnswer::LookupFailed => DnsEntry::LookupFailed,
        }
    }
}

/// One entry in the list `result()` returns: either a verify-outcome for a
/// signature discovered in the message, or a sign-outcome for a requested
/// sign-template.
#[derive(Debug, Clone)]
pub enum ResultRecord {
    Verify {
        signature: Box<Signature>,
        dns_name: String,
        /// `None` means "awaiting DNS": the caller must look up `dns_name`
        /// and call `provide_dns` before this signature can resolve.
        status: Option<VerifyStatus>,
        error: Option<String>,
    },
    Sign {
        domain: String,
        selector: String,
        status: VerifyStatus,
        error: Option<String>,
        /// The finished `DKIM-Signature:` header text, present only when
        /// `status == Valid`.
        header: Option<String>,
    },
    /// A `DKIM-Signature:` field that failed to parse at all. Still
    /// occupies a slot so the result list stays positionally aligned with
    /// the header fields the message carried.
    Unparsed { status: VerifyStatus, error: String },
}

impl ResultRecord {
    pub fn status(&self) -> Option<VerifyStatus> {
        match self {
            ResultRecord::Verify { status, .. } => *status,
            ResultRecord::Sign { status, .. } => Some(*status),
            ResultRecord::Unparsed { status, .. } => Some(*status),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ResultRecord::Verify { status: None, .. })
    }
}

/// Runs the verification substeps of SPEC_FULL.md section 4.10 once a
/// signature's key is in hand and both hashes are computed.
pub fn verify_against_key(
    sig: &Signature,
    key: &PublicKeyRecord,
    computed_body_hash: &[u8],
    computed_header_hash: &[u8],
) -> (VerifyStatus, Option<String>) {
    let fail_status = if key.is_testing() {
        VerifyStatus::SoftFail
    } else {
        VerifyStatus::PermFail
    };

    if key.is_revoked() {
        return (fail_status, Some("key revoked".to_string()));
    }
    if !key.allows_hash(sig.algo.key_hash_name()) {
        return (fail_status, Some("hash algorithm not allowed".to_string()));
    }
    if key.is_strict() && !identity_exactly_matches(&sig.identity, &sig.domain) {
        return (
            fail_status,
            Some("identity does not match domain".to_string()),
        );
    }
    if computed_body_hash != sig.body_hash.as_slice() {
        return (fail_status, Some("body hash mismatch".to_string()));
    }
    let public_key = match &key.public_key {
        Some(k) => k,
        None => return (fail_status, Some("key revoked".to_string())),
    };
    if crate::rsa_sign::verify(public_key, sig.algo, computed_header_hash, &sig.signature).is_err()
    {
        return (fail_status, Some("header sig mismatch".to_string()));
    }

    (VerifyStatus::Valid, None)
}

fn identity_exactly_matches(identity: &str, domain: &str) -> bool {
    identity
        .rsplit_once('@')
        .map(|(_, d)| d.eq_ignore_ascii_case(domain))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::Canon;
    use crate::hash::HashAlgo;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(VerifyStatus::Valid.code(), 1);
        assert_eq!(VerifyStatus::TempFail.code(), -1);
        assert_eq!(VerifyStatus::SoftFail.code(), -2);
        assert_eq!(VerifyStatus::PermFail.code(), 0);
        assert_eq!(VerifyStatus::InvalidHeader.code(), -3);
    }

    #[test]
    fn test_dns_answer_conversion() {
        assert!(matches!(
            DnsEntry::from(DnsAnswer::LookupFailed),
            DnsEntry::LookupFailed
        ));
        assert!(matches!(
            DnsEntry::from(DnsAnswer::Txt("v=DKIM1".into())),
            DnsEntry::Unresolved(v) if v == vec!["v=DKIM1".to_string()]
        ));
    }

    fn sample_signature() -> Signature {
        Signature {
            domain: "example.com".to_string(),
            selector: "brisbane".to_string(),
            signed_headers: vec!["from".to_string()],
            signature: vec![1, 2, 3],
            body_hash: vec![9, 9, 9],
            algo: HashAlgo::RsaSha256,
            header_canon: Canon::Relaxed,
            body_canon: Canon::Relaxed,
            identity: "@example.com".to_string(),
            body_length: None,
            timestamp: None,
            expiration: None,
            query_method: "dns/txt".to_string(),
            raw_b_value: "AAAA".to_string(),
        }
    }

    fn sample_key(public_key: Option<rsa::RsaPublicKey>) -> PublicKeyRecord {
        PublicKeyRecord {
            version: "DKIM1".to_string(),
            key_type: "rsa".to_string(),
            public_key,
            hashes: ["sha1", "sha256"].iter().map(|s| s.to_string()).collect(),
            service_types: ["*"].iter().map(|s| s.to_string()).collect(),
            flags: Default::default(),
        }
    }

    #[test]
    fn test_verify_against_key_revoked_key_perm_fails() {
        let sig = sample_signature();
        let key = sample_key(None);
        let (status, error) = verify_against_key(&sig, &key, &sig.body_hash, b"hash");
        assert_eq!(status, VerifyStatus::PermFail);
        assert_eq!(error, Some("key revoked".to_string()));
    }

    #[test]
    fn test_verify_against_key_revoked_testing_key_soft_fails() {
        let sig = sample_signature();
        let mut key = sample_key(None);
        key.flags.insert('y');
        let (status, _) = verify_against_key(&sig, &key, &sig.body_hash, b"hash");
        assert_eq!(status, VerifyStatus::SoftFail);
    }

    #[test]
    fn test_verify_against_key_hash_not_allowed() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = rsa::RsaPublicKey::from(&private);
        let sig = sample_signature();
        let mut key = sample_key(Some(public));
        key.hashes.clear();
        key.hashes.insert("sha1".to_string());
        let (status, error) = verify_against_key(&sig, &key, &sig.body_hash, b"hash");
        assert_eq!(status, VerifyStatus::PermFail);
        assert_eq!(error, Some("hash algorithm not allowed".to_string()));
    }

    #[test]
    fn test_verify_against_key_strict_identity_mismatch() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = rsa::RsaPublicKey::from(&private);
        let mut sig = sample_signature();
        sig.identity = "@other.com".to_string();
        let mut key = sample_key(Some(public));
        key.flags.insert('s');
        let (status, error) = verify_against_key(&sig, &key, &sig.body_hash, b"hash");
        assert_eq!(status, VerifyStatus::PermFail);
        assert_eq!(error, Some("identity does not match domain".to_string()));
    }

    #[test]
    fn test_verify_against_key_body_hash_mismatch() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = rsa::RsaPublicKey::from(&private);
        let sig = sample_signature();
        let key = sample_key(Some(public));
        let (status, error) = verify_against_key(&sig, &key, b"different", b"hash");
        assert_eq!(status, VerifyStatus::PermFail);
        assert_eq!(error, Some("body hash mismatch".to_string()));
    }

    #[test]
    fn test_verify_against_key_header_sig_mismatch_on_wrong_key() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = rsa::RsaPublicKey::from(&private);
        let sig = sample_signature();
        let key = sample_key(Some(public));
        let (status, error) = verify_against_key(&sig, &key, &sig.body_hash, b"hash");
        assert_eq!(status, VerifyStatus::PermFail);
        assert_eq!(error, Some("header sig mismatch".to_string()));
    }

    #[test]
    fn test_verify_against_key_valid_signature() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = rsa::RsaPublicKey::from(&private);
        let mut sig = sample_signature();
        let header_hash = crate::hash::digest(HashAlgo::RsaSha256, b"header bytes");
        sig.signature =
            crate::rsa_sign::sign(&private, HashAlgo::RsaSha256, &header_hash).unwrap();
        let key = sample_key(Some(public));
        let (status, error) = verify_against_key(&sig, &key, &sig.body_hash, &header_hash);
        assert_eq!(status, VerifyStatus::Valid);
        assert_eq!(error, None);
    }
}
