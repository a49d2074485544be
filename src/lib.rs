//! An iterative, non-blocking implementation of DKIM
//! (<https://datatracker.ietf.org/doc/html/rfc6376>): verification and
//! signing as a pure state machine, driven entirely by the caller.
//!
//! The engine never performs I/O. A caller feeds message bytes to
//! [`Engine::append`] as they arrive and, once a signature is discovered,
//! resolves its DNS key itself and hands the answer back through
//! [`Engine::result`]. This keeps the crate usable from any I/O model:
//! synchronous, async, or embedded in something that doesn't have a runtime
//! at all.

#[macro_use]
extern crate quick_error;

mod canon;
mod codec;
mod emit;
mod engine;
mod errors;
mod hash;
mod key;
mod rsa_sign;
mod result;
mod signature;
mod tag_list;

pub use canon::Canon;
pub use engine::{Engine, EngineBuilder};
pub use errors::{DKIMError, Status};
pub use hash::HashAlgo;
pub use key::{parse_record, PublicKeyRecord};
pub use result::{verify_against_key, DnsAnswer, DnsEntry, ResultRecord, VerifyStatus};
pub use signature::{SignExpiry, SignTemplate, SignTemplateBuilder, Signature};
pub use tag_list::{parse_unique_tag_list, tag_list as parse_tag_list, Tag};
