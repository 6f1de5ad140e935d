//! Canonical JSON encoding, SHA-256 fingerprinting, and the shared error
//! taxonomy used by every crate in the import wizard core.

pub mod canon;
pub mod error;

pub use canon::{
    ascii_coerce, canonical_json_bytes, fingerprint, fingerprint_json, fingerprint_str,
    sha256_hex, truncated_fingerprint,
};
pub use error::{CoreError, ErrorDetail};
