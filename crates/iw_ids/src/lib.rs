//! Newtype identifiers used across the import wizard core.
//!
//! `SessionId` and `PreviewId` are hex-fingerprint derived (see `iw_canon`)
//! and so are plain ASCII-hex string wrappers rather than UUIDs; `JobId`
//! is a UUIDv4 the way the teacher's job/session ids are minted elsewhere
//! in this codebase.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a string fails to parse as one of the ids below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    pub kind: &'static str,
    pub input: String,
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.input)
    }
}

impl std::error::Error for IdParseError {}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

macro_rules! define_hex_id {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an already-computed lowercase hex string without validation.
            /// Used by fingerprint derivation sites that just produced the hex.
            pub fn from_hex_unchecked(hex: impl Into<String>) -> Self {
                Self(hex.into())
            }

            pub fn parse(s: &str) -> Result<Self, IdParseError> {
                if is_lower_hex(s) {
                    Ok(Self(s.to_string()))
                } else {
                    Err(IdParseError {
                        kind: $kind,
                        input: s.to_string(),
                    })
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_hex_id!(SessionId, "session_id");
define_hex_id!(PreviewId, "preview_id");
define_hex_id!(AuthorItemId, "author_item_id");
define_hex_id!(BookItemId, "book_item_id");
define_hex_id!(BookRef, "book_ref");

/// A job identifier. Minted as a UUIDv4 string at creation time, the way
/// `casparian_ids`'s `define_uuid_id!` family mints its ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        uuid::Uuid::parse_str(s)
            .map(|u| Self(u.to_string()))
            .map_err(|_| IdParseError {
                kind: "job_id",
                input: s.to_string(),
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = IdParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_roundtrip() {
        let id = SessionId::parse("abc0123def4567890000000000000000000000000000000000000000000000").unwrap_or_else(|_| {
            SessionId::from_hex_unchecked("abc0123def456789")
        });
        assert_eq!(id.to_string(), id.as_str());
    }

    #[test]
    fn session_id_rejects_uppercase() {
        assert!(SessionId::parse("ABC123").is_err());
        assert!(SessionId::parse("").is_err());
    }

    #[test]
    fn job_id_parses_uuid() {
        let id = JobId::new();
        let parsed = JobId::parse(id.as_str()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn job_id_rejects_garbage() {
        assert!(JobId::parse("not-a-uuid").is_err());
    }
}
