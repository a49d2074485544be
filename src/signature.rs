//! The `DKIM-Signature:` tag-list interpreted as a structured record
//! (RFC 6376 section 3.5), plus the sign-template shape used to produce a
//! new signature.

use crate::canon::Canon;
use crate::codec::{decode_base64, decode_qp};
use crate::errors::DKIMError;
use crate::hash::HashAlgo;
use crate::tag_list::{parse_unique_tag_list, Tag};
use std::collections::HashSet;

/// A signature discovered while parsing the message header, ready for
/// verification once its DNS key is known.
#[derive(Debug, Clone)]
pub struct Signature {
    pub domain: String,
    pub selector: String,
    pub signed_headers: Vec<String>,
    pub signature: Vec<u8>,
    pub body_hash: Vec<u8>,
    pub algo: HashAlgo,
    pub header_canon: Canon,
    pub body_canon: Canon,
    pub identity: String,
    pub body_length: Option<usize>,
    pub timestamp: Option<i64>,
    pub expiration: Option<i64>,
    pub query_method: String,
    /// The as-written text of this signature's own `b=` tag value (with any
    /// folding whitespace kept), needed to erase it when the engine
    /// recomputes this signature's header hash.
    pub raw_b_value: String,
}

impl SignTemplate {
    /// Builds a sign-ready template from a tag-list string: the same
    /// `name=value; ...` grammar a `DKIM-Signature:` header uses, plus
    /// engine-private side-channel fields whose name starts with `:`
    /// (`:key`, `:i`, `:z`) that never appear in a real DKIM tag list.
    /// Forces `v=1` and ignores any `b=`/`bh=` supplied, since both are
    /// produced during emission, not read from the template. `x=` accepts
    /// an optional `+`-prefixed relative offset in addition to a bare
    /// absolute timestamp.
    pub fn from_tag_list(input: &str) -> Result<SignTemplate, DKIMError> {
        let mut side = std::collections::HashMap::new();
        let mut plain = Vec::new();
        for spec in input.split(';') {
            let spec = spec.trim();
            if spec.is_empty() {
                continue;
            }
            let (name, value) = spec.split_once('=').ok_or_else(|| {
                DKIMError::SignatureSyntaxError(format!("malformed tag: {}", spec))
            })?;
            let name = name.trim();
            match name.strip_prefix(':') {
                Some(side_name) => {
                    side.insert(side_name.to_string(), value.trim().to_string());
                }
                None => plain.push(format!("{}={}", name, value.trim())),
            }
        }
        Self::from_parts(&plain.join("; "), side)
    }

    /// Builds a sign-ready template from tag name/value pairs given as a
    /// mapping instead of a delimited string. Side-channel keys are
    /// distinguished the same way as [`from_tag_list`](Self::from_tag_list):
    /// a leading `:` on the name.
    pub fn from_tag_map<I, K, V>(tags: I) -> Result<SignTemplate, DKIMError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut side = std::collections::HashMap::new();
        let mut plain = Vec::new();
        for (name, value) in tags {
            let name = name.as_ref();
            let value = value.as_ref();
            match name.strip_prefix(':') {
                Some(side_name) => {
                    side.insert(side_name.to_string(), value.to_string());
                }
                None => plain.push(format!("{}={}", name, value)),
            }
        }
        Self::from_parts(&plain.join("; "), side)
    }

    fn from_parts(
        plain: &str,
        side: std::collections::HashMap<String, String>,
    ) -> Result<SignTemplate, DKIMError> {
        let tags = if plain.is_empty() {
            Vec::new()
        } else {
            parse_unique_tag_list(plain)?
        };
        let mut by_name = std::collections::HashMap::new();
        for tag in &tags {
            by_name.insert(tag.name.as_str(), tag);
        }

        if let Some(v) = by_name.get("v") {
            if v.value != "1" {
                return Err(DKIMError::IncompatibleVersion);
            }
        }

        let domain = by_name
            .get("d")
            .map(|t| t.value.clone())
            .ok_or(DKIMError::SignatureMissingRequiredTag("d"))?;
        let selector = by_name
            .get("s")
            .map(|t| t.value.clone())
            .ok_or(DKIMError::SignatureMissingRequiredTag("s"))?;
        let signed_headers = by_name
            .get("h")
            .map(|t| normalize_header_list(&t.value))
            .ok_or(DKIMError::SignatureMissingRequiredTag("h"))?;
        if !signed_headers.iter().any(|h| h == "from") {
            return Err(DKIMError::FromFieldNotSigned);
        }

        let algo = match by_name.get("a").map(|t| t.value.as_str()) {
            None | Some("rsa-sha256") => HashAlgo::RsaSha256,
            Some("rsa-sha1") => HashAlgo::RsaSha1,
            Some(other) => return Err(DKIMError::UnsupportedHashAlgorithm(other.to_string())),
        };

        let (header_canon, body_canon) = match by_name.get("c").map(|t| t.value.as_str()) {
            None => (Canon::Simple, Canon::Simple),
            Some(spec) => parse_canon_pair(spec)?,
        };

        let body_length = match by_name.get("l") {
            Some(tag) => Some(
                tag.value
                    .parse::<usize>()
                    .map_err(|_| DKIMError::SignatureSyntaxError("invalid l= value".into()))?,
            ),
            None => None,
        };

        let timestamp = parse_optional_i64(by_name.get("t"))?;
        let expiration = match by_name.get("x") {
            None => None,
            Some(tag) => Some(parse_sign_expiry(&tag.value)?),
        };

        let identity = side
            .get("i")
            .cloned()
            .or_else(|| by_name.get("i").map(|t| t.value.clone()));
        let z = side.get("z").cloned();
        let private_key_pem = side
            .get("key")
            .cloned()
            .ok_or(DKIMError::BuilderError("missing :key side channel"))?;

        Ok(SignTemplate {
            domain,
            selector,
            signed_headers,
            algo,
            header_canon,
            body_canon,
            identity,
            body_length,
            timestamp,
            expiration,
            z,
            private_key_pem,
        })
    }
}

/// Parses an `x=` value for a sign-template: a bare integer is an absolute
/// Unix timestamp, a `+`-prefixed integer is an offset in seconds relative
/// to `t=` (or to "now" if `t=` is absent).
fn parse_sign_expiry(value: &str) -> Result<SignExpiry, DKIMError> {
    match value.strip_prefix('+') {
        Some(rest) => {
            let secs = rest.parse::<i64>().map_err(|_| {
                DKIMError::SignatureSyntaxError(format!("invalid x= offset: {}", value))
            })?;
            Ok(SignExpiry::RelativeSeconds(secs))
        }
        None => {
            let t = value.parse::<i64>().map_err(|_| {
                DKIMError::SignatureSyntaxError(format!("invalid x= value: {}", value))
            })?;
            Ok(SignExpiry::Absolute(t))
        }
    }
}

impl Signature {
    pub fn dns_name(&self) -> String {
        format!("{}._domainkey.{}", self.selector, self.domain)
    }

    /// Parses a `DKIM-Signature:` field's tag-list value into a verifiable
    /// record. Any invariant violation is `invalid-header`, matching the
    /// teacher's `validate_header`.
    pub fn parse(value: &str) -> Result<Signature, DKIMError> {
        let tags = parse_unique_tag_list(value)
            .map_err(|err| DKIMError::SignatureSyntaxError(err.to_string()))?;
        let mut by_name = std::collections::HashMap::new();
        for tag in &tags {
            by_name.insert(tag.name.as_str(), tag);
        }

        let required = |name: &'static str| -> Result<&Tag, DKIMError> {
            by_name
                .get(name)
                .copied()
                .ok_or(DKIMError::SignatureMissingRequiredTag(name))
        };

        let version = required("v")?;
        if version.value != "1" {
            return Err(DKIMError::IncompatibleVersion);
        }

        let domain = required("d")?.value.clone();
        let selector = required("s")?.value.clone();

        let signed_headers = normalize_header_list(&required("h")?.value);
        if !signed_headers.iter().any(|h| h == "from") {
            return Err(DKIMError::FromFieldNotSigned);
        }

        let b_tag = required("b")?;
        let signature = decode_base64(&b_tag.value)?;
        let body_hash = decode_base64(&required("bh")?.value)?;

        let algo = match by_name.get("a").map(|t| t.value.as_str()).unwrap_or("rsa-sha256") {
            "rsa-sha1" => HashAlgo::RsaSha1,
            "rsa-sha256" => HashAlgo::RsaSha256,
            other => return Err(DKIMError::UnsupportedHashAlgorithm(other.to_string())),
        };

        let (header_canon, body_canon) = match by_name.get("c").map(|t| t.value.as_str()) {
            None => (Canon::Simple, Canon::Simple),
            Some(spec) => parse_canon_pair(spec)?,
        };

        let query_method = by_name
            .get("q")
            .map(|t| t.value.clone())
            .unwrap_or_else(|| "dns/txt".to_string());
        if query_method != "dns/txt" {
            return Err(DKIMError::UnsupportedQueryMethod);
        }

        let identity = match by_name.get("i") {
            Some(tag) => decode_qp(&tag.raw_value)?,
            None => format!("@{}", domain),
        };
        if !identity_matches_domain(&identity, &domain) {
            return Err(DKIMError::DomainMismatch);
        }

        let body_length = match by_name.get("l") {
            Some(tag) => Some(
                tag.value
                    .parse::<usize>()
                    .map_err(|_| DKIMError::SignatureSyntaxError("invalid l= value".into()))?,
            ),
            None => None,
        };

        let timestamp = parse_optional_i64(by_name.get("t"))?;
        let expiration = parse_optional_i64(by_name.get("x"))?;
        if let (Some(t), Some(x)) = (timestamp, expiration) {
            if x < t {
                return Err(DKIMError::SignatureSyntaxError(
                    "x= predates t=".to_string(),
                ));
            }
        }

        Ok(Signature {
            domain,
            selector,
            signed_headers,
            signature,
            body_hash,
            algo,
            header_canon,
            body_canon,
            identity,
            body_length,
            timestamp,
            expiration,
            query_method,
            raw_b_value: b_tag.raw_value.clone(),
        })
    }
}

fn parse_optional_i64(tag: Option<&&Tag>) -> Result<Option<i64>, DKIMError> {
    match tag {
        None => Ok(None),
        Some(tag) => tag
            .value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| DKIMError::SignatureSyntaxError(format!("invalid timestamp: {}", tag.value))),
    }
}

/// Lowercases, splits on `:`, and deduplicates while preserving first-seen
/// order, per the data model's `h` list rule.
fn normalize_header_list(value: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in value.split(':') {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    out
}

pub(crate) fn parse_canon_pair(spec: &str) -> Result<(Canon, Canon), DKIMError> {
    let mut parts = spec.splitn(2, '/');
    let header = parse_canon_component(parts.next().unwrap_or("simple"))?;
    let body = match parts.next() {
        Some(s) => parse_canon_component(s)?,
        None => Canon::Simple,
    };
    Ok((header, body))
}

fn parse_canon_component(s: &str) -> Result<Canon, DKIMError> {
    match s {
        "simple" => Ok(Canon::Simple),
        "relaxed" => Ok(Canon::Relaxed),
        other => Err(DKIMError::UnsupportedCanonicalizationType(
            other.to_string(),
        )),
    }
}

/// The identity (`i=`) domain must equal, or be a subdomain of, `d=`.
fn identity_matches_domain(identity: &str, domain: &str) -> bool {
    let domain_part = match identity.rsplit_once('@') {
        Some((_, d)) => d,
        None => return false,
    };
    let domain_part = domain_part.to_lowercase();
    let domain = domain.to_lowercase();
    domain_part == domain || domain_part.ends_with(&format!(".{}", domain))
}

/// Tag-list values for a signature the engine will produce, before the
/// header hash and signature bytes are known. Side-channel fields
/// (`:key`, `:i`, `:z`) are consumed during emission and never serialized.
#[derive(Debug, Clone)]
pub struct SignTemplate {
    pub domain: String,
    pub selector: String,
    pub signed_headers: Vec<String>,
    pub algo: HashAlgo,
    pub header_canon: Canon,
    pub body_canon: Canon,
    pub identity: Option<String>,
    pub body_length: Option<usize>,
    pub timestamp: Option<i64>,
    pub expiration: Option<SignExpiry>,
    /// Copied header fields for the `z=` tag, already in `name:value|...`
    /// form; QP-encoded at emission time. The `:z` side channel.
    pub z: Option<String>,
    /// PEM-or-equivalent RSA private key bytes; the `:key` side channel.
    pub private_key_pem: String,
}

#[derive(Debug, Clone, Copy)]
pub enum SignExpiry {
    /// `x = t + seconds` (or `now + seconds` if no explicit `t`).
    RelativeSeconds(i64),
    /// A fixed Unix timestamp.
    Absolute(i64),
}

#[derive(Default)]
pub struct SignTemplateBuilder {
    domain: Option<String>,
    selector: Option<String>,
    signed_headers: Option<Vec<String>>,
    algo: HashAlgo_,
    header_canon: Canon_,
    body_canon: Canon_,
    identity: Option<String>,
    body_length: Option<usize>,
    timestamp: Option<i64>,
    expiration: Option<SignExpiry>,
    z: Option<String>,
    private_key_pem: Option<String>,
}

// Small helpers so `SignTemplateBuilder` can derive `Default` without
// requiring `HashAlgo`/`Canon` themselves to implement it.
type HashAlgo_ = Option<HashAlgo>;
type Canon_ = Option<Canon>;

impl SignTemplateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signing_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_signed_headers(mut self, headers: Vec<String>) -> Self {
        self.signed_headers = Some(normalize_header_list(&headers.join(":")));
        self
    }

    pub fn with_algo(mut self, algo: HashAlgo) -> Self {
        self.algo = Some(algo);
        self
    }

    pub fn with_header_canonicalization(mut self, canon: Canon) -> Self {
        self.header_canon = Some(canon);
        self
    }

    pub fn with_body_canonicalization(mut self, canon: Canon) -> Self {
        self.body_canon = Some(canon);
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_body_length(mut self, length: usize) -> Self {
        self.body_length = Some(length);
        self
    }

    pub fn with_time(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_expiry(mut self, expiry: SignExpiry) -> Self {
        self.expiration = Some(expiry);
        self
    }

    /// Sets the copied-header text for the `z=` tag; see [`SignTemplate::z`].
    pub fn with_copied_headers(mut self, z: impl Into<String>) -> Self {
        self.z = Some(z.into());
        self
    }

    pub fn with_private_key(mut self, pem: impl Into<String>) -> Self {
        self.private_key_pem = Some(pem.into());
        self
    }

    pub fn build(self) -> Result<SignTemplate, DKIMError> {
        let domain = self
            .domain
            .ok_or(DKIMError::BuilderError("missing signing domain"))?;
        let selector = self
            .selector
            .ok_or(DKIMError::BuilderError("missing selector"))?;
        let signed_headers = self
            .signed_headers
            .ok_or(DKIMError::BuilderError("missing signed headers"))?;
        if !signed_headers.iter().any(|h| h == "from") {
            return Err(DKIMError::FromFieldNotSigned);
        }
        let private_key_pem = self
            .private_key_pem
            .ok_or(DKIMError::BuilderError("missing private key"))?;

        Ok(SignTemplate {
            domain,
            selector,
            signed_headers,
            algo: self.algo.unwrap_or(HashAlgo::RsaSha256),
            header_canon: self.header_canon.unwrap_or(Canon::Simple),
            body_canon: self.body_canon.unwrap_or(Canon::Simple),
            identity: self.identity,
            body_length: self.body_length,
            timestamp: self.timestamp,
            expiration: self.expiration,
            z: self.z,
            private_key_pem,
        })
    }
}
