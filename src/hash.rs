use crate::codec::encode_base64;
use sha1::Sha1;
use sha2::Sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    RsaSha1,
    RsaSha256,
}

impl HashAlgo {
    pub fn algo_name(&self) -> &'static str {
        match self {
            Self::RsaSha1 => "rsa-sha1",
            Self::RsaSha256 => "rsa-sha256",
        }
    }

    /// The name this algorithm may appear under in a key record's `h=` set.
    pub fn key_hash_name(&self) -> &'static str {
        match self {
            Self::RsaSha1 => "sha1",
            Self::RsaSha256 => "sha256",
        }
    }
}

/// Wraps a digest context, silently dropping bytes past an optional `l=`
/// byte budget. One instance lives per signature's body pipeline.
pub(crate) struct LimitHasher {
    pub limit: usize,
    pub hashed: usize,
    pub hasher: HashImpl,
}

impl LimitHasher {
    pub fn new(algo: HashAlgo, limit: Option<usize>) -> Self {
        LimitHasher {
            hasher: HashImpl::from_algo(algo),
            limit: limit.unwrap_or(usize::MAX),
            hashed: 0,
        }
    }

    pub fn hash(&mut self, bytes: &[u8]) {
        if self.hashed >= self.limit {
            return;
        }
        let remain = self.limit - self.hashed;
        let len = bytes.len().min(remain);
        self.hasher.hash(&bytes[..len]);
        self.hashed += len;
    }

    pub fn finalize_bytes(self) -> Vec<u8> {
        self.hasher.finalize_bytes()
    }
}

pub(crate) enum HashImpl {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl HashImpl {
    pub fn from_algo(algo: HashAlgo) -> Self {
        use sha1::Digest as _;
        use sha2::Digest as _;
        match algo {
            HashAlgo::RsaSha1 => Self::Sha1(Sha1::new()),
            HashAlgo::RsaSha256 => Self::Sha256(Sha256::new()),
        }
    }

    pub fn hash(&mut self, bytes: &[u8]) {
        use sha1::Digest as _;
        use sha2::Digest as _;
        match self {
            Self::Sha1(hasher) => hasher.update(bytes),
            Self::Sha256(hasher) => hasher.update(bytes),
        }
    }

    pub fn finalize_bytes(self) -> Vec<u8> {
        use sha1::Digest as _;
        use sha2::Digest as _;
        match self {
            Self::Sha1(hasher) => hasher.finalize().to_vec(),
            Self::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }
}

/// One-shot digest of an arbitrary byte slice, used for the final header
/// hash once canonicalized header bytes have been assembled.
pub(crate) fn digest(algo: HashAlgo, bytes: &[u8]) -> Vec<u8> {
    let mut hasher = HashImpl::from_algo(algo);
    hasher.hash(bytes);
    hasher.finalize_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_hasher_truncates() {
        let mut hasher = LimitHasher::new(HashAlgo::RsaSha256, Some(3));
        hasher.hash(b"hello world");
        assert_eq!(hasher.finalize_bytes(), digest(HashAlgo::RsaSha256, b"hel"));
    }

    #[test]
    fn test_limit_hasher_unbounded() {
        let mut hasher = LimitHasher::new(HashAlgo::RsaSha1, None);
        hasher.hash(b"hello ");
        hasher.hash(b"world");
        assert_eq!(
            hasher.finalize_bytes(),
            digest(HashAlgo::RsaSha1, b"hello world")
        );
    }
}
