//! RSA sign/verify primitive (RFC 6376 section 3.3's EMSA-PKCS1-v1_5 step).
//!
//! A thin wrapper over `rsa::Pkcs1v15Sign`: the crate already builds the
//! DigestInfo-prefixed padding specified by PKCS#1 v1.5, so there is no
//! reason to hand-roll it.

use crate::errors::DKIMError;
use crate::hash::HashAlgo;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;

fn scheme(algo: HashAlgo) -> Pkcs1v15Sign {
    match algo {
        HashAlgo::RsaSha1 => Pkcs1v15Sign::new::<Sha1>(),
        HashAlgo::RsaSha256 => Pkcs1v15Sign::new::<Sha256>(),
    }
}

/// Signs a pre-computed digest (the header hash), returning raw signature
/// bytes. Callers base64-encode the result for the `b=` tag.
pub(crate) fn sign(
    key: &RsaPrivateKey,
    algo: HashAlgo,
    digest: &[u8],
) -> Result<Vec<u8>, DKIMError> {
    // PKCS#1 v1.5 signing is deterministic (unlike PSS), so no RNG is needed.
    key.sign(scheme(algo), digest)
        .map_err(|err| DKIMError::FailedToSign(err.to_string()))
}

/// Verifies a signature against a pre-computed digest. Any failure
/// (padding mismatch, wrong digest, corrupt signature bytes) is reported as
/// `HeaderSigMismatch`, matching the single "the signature did not verify"
/// bucket the result record exposes.
pub(crate) fn verify(
    key: &RsaPublicKey,
    algo: HashAlgo,
    digest: &[u8],
    signature: &[u8],
) -> Result<(), DKIMError> {
    key.verify(scheme(algo), digest, signature)
        .map_err(|_| DKIMError::HeaderSigMismatch)
}

/// Decodes a DNS `p=` value into an RSA public key, trying PKCS#8 (the
/// common form published today) before falling back to bare PKCS#1, the
/// same fallback order the teacher and the wider pack use.
pub(crate) fn decode_public_key(der: &[u8]) -> Result<RsaPublicKey, DKIMError> {
    RsaPublicKey::from_public_key_der(der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
        .map_err(|err| DKIMError::InvalidKeyRecord(format!("invalid RSA public key: {}", err)))
}

/// Decodes a sign-template's PEM (or bare base64 DER) private key, trying
/// PKCS#1 before falling back to PKCS#8.
pub(crate) fn decode_private_key(pem: &str) -> Result<RsaPrivateKey, DKIMError> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|err| DKIMError::KeyUnavailable(format!("invalid RSA private key: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::traits::PublicKeyParts;

    fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
        use rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    #[test]
    fn test_sign_then_verify_roundtrip() {
        let (private, public) = test_keypair();
        let digest = crate::hash::digest(HashAlgo::RsaSha256, b"hello world");
        let sig = sign(&private, HashAlgo::RsaSha256, &digest).unwrap();
        assert!(verify(&public, HashAlgo::RsaSha256, &digest, &sig).is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_digest() {
        let (private, public) = test_keypair();
        let digest = crate::hash::digest(HashAlgo::RsaSha256, b"hello world");
        let sig = sign(&private, HashAlgo::RsaSha256, &digest).unwrap();
        let other_digest = crate::hash::digest(HashAlgo::RsaSha256, b"goodbye world");
        assert!(verify(&public, HashAlgo::RsaSha256, &other_digest, &sig).is_err());
    }

    #[test]
    fn test_decode_public_key_pkcs8_roundtrip() {
        let (_, public) = test_keypair();
        let der = public.to_public_key_der().unwrap();
        let decoded = decode_public_key(der.as_bytes()).unwrap();
        assert_eq!(decoded.n(), public.n());
    }
}
