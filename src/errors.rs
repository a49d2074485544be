/// Bucket a [`DKIMError`] sorts into, independent of the exact reason.
///
/// Mirrors the five-way split the engine's result records use (see
/// `result::VerifyStatus`), minus `Valid`, which is never an error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    InvalidHeader,
    SoftFail,
    TempFail,
    PermFail,
}

quick_error! {
    #[derive(Debug, PartialEq, Clone)]
    /// DKIM errors
    pub enum DKIMError {
        UnsupportedHashAlgorithm(value: String) {
            display("unsupported hash algorithm: {}", value)
        }
        UnsupportedCanonicalizationType(value: String) {
            display("unsupported canonicalization: {}", value)
        }
        SignatureSyntaxError(err: String) {
            display("signature syntax error: {}", err)
        }
        SignatureMissingRequiredTag(name: &'static str) {
            display("signature missing required tag ({})", name)
        }
        IncompatibleVersion {
            display("incompatible version")
        }
        DomainMismatch {
            display("identity does not match domain")
        }
        FromFieldNotSigned {
            display("From field not signed")
        }
        SignatureExpired {
            display("signature expired")
        }
        UnsupportedQueryMethod {
            display("unsupported query method")
        }
        KeyRevoked {
            display("key revoked")
        }
        NoKeyForSignature {
            display("no key for signature")
        }
        InvalidKeyRecord(err: String) {
            display("invalid or empty DKIM record: {}", err)
        }
        KeyIncompatibleVersion {
            display("key incompatible version")
        }
        InappropriateKeyAlgorithm {
            display("inappropriate key algorithm")
        }
        HashAlgorithmNotAllowed {
            display("hash algorithm not allowed")
        }
        HeaderSigMismatch {
            display("header sig mismatch")
        }
        BodyHashMismatch {
            display("body hash mismatch")
        }
        DnsLookupFailed(name: String) {
            display("dns lookup failed for {}", name)
        }
        KeyUnavailable(err: String) {
            display("key unavailable: {}", err)
        }
        FailedToSign(err: String) {
            display("failed to sign: {}", err)
        }
        BuilderError(err: &'static str) {
            display("failed to build object: {}", err)
        }
        HeaderSerializeError(err: String) {
            display("failed to serialize DKIM header: {}", err)
        }
        UnknownInternalError(err: String) {
            display("internal error: {}", err)
        }
    }
}

impl DKIMError {
    /// Maps an error to the outcome bucket its containing result record
    /// should carry. `KeyRevoked`/`HashAlgorithmNotAllowed`/etc. are folded
    /// into `PermFail` here; the testing-key (`t=y`) downgrade to `SoftFail`
    /// happens at the call site, since it depends on the key record, not
    /// the error variant alone.
    pub fn status(&self) -> Status {
        use DKIMError::*;
        match self {
            SignatureSyntaxError(_) | SignatureMissingRequiredTag(_) | IncompatibleVersion
            | DomainMismatch | FromFieldNotSigned | UnsupportedQueryMethod => {
                Status::InvalidHeader
            }
            SignatureExpired => Status::SoftFail,
            DnsLookupFailed(_) => Status::TempFail,
            KeyRevoked
            | NoKeyForSignature
            | InvalidKeyRecord(_)
            | KeyIncompatibleVersion
            | InappropriateKeyAlgorithm
            | HashAlgorithmNotAllowed
            | HeaderSigMismatch
            | BodyHashMismatch
            | UnsupportedHashAlgorithm(_)
            | UnsupportedCanonicalizationType(_)
            | KeyUnavailable(_) => Status::PermFail,
            FailedToSign(_) | BuilderError(_) | HeaderSerializeError(_) | UnknownInternalError(_) => {
                Status::PermFail
            }
        }
    }
}
