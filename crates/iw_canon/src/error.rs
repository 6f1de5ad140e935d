//! Shared error taxonomy (§6.2, §7).
//!
//! Every externally callable operation in the import wizard core returns
//! either a success payload or the uniform error envelope
//! `{error:{code,message,details}}`. `CoreError` is the in-process
//! representation; `to_envelope` produces the wire form.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// A single validation/invariant detail attached to an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    /// JSON-pointer-ish path into the offending payload, e.g. `$.selection_ids[2]`.
    pub path: String,
    /// snake_case machine-readable reason, e.g. `unknown_field`.
    pub reason: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl ErrorDetail {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}

/// Closed taxonomy of error codes (§6.2). One variant per code; each
/// carries a message plus zero or more structured details.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error("{message}")]
    InvariantViolation {
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error("{message}")]
    NotFound {
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error("{message}")]
    ConflictsUnresolved {
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error("{message}")]
    Internal {
        message: String,
        details: Vec<ErrorDetail>,
    },
}

impl CoreError {
    pub fn validation(path: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: vec![ErrorDetail::new(path, reason)],
        }
    }

    pub fn validation_with(message: impl Into<String>, details: Vec<ErrorDetail>) -> Self {
        Self::Validation {
            message: message.into(),
            details,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn invariant_reason(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
            details: vec![ErrorDetail::new("$", reason)],
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn conflicts_unresolved(message: impl Into<String>) -> Self {
        Self::ConflictsUnresolved {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation { .. } => "VALIDATION_ERROR",
            CoreError::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::ConflictsUnresolved { .. } => "CONFLICTS_UNRESOLVED",
            CoreError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CoreError::Validation { message, .. }
            | CoreError::InvariantViolation { message, .. }
            | CoreError::NotFound { message, .. }
            | CoreError::ConflictsUnresolved { message, .. }
            | CoreError::Internal { message, .. } => message,
        }
    }

    pub fn details(&self) -> &[ErrorDetail] {
        match self {
            CoreError::Validation { details, .. }
            | CoreError::InvariantViolation { details, .. }
            | CoreError::NotFound { details, .. }
            | CoreError::ConflictsUnresolved { details, .. }
            | CoreError::Internal { details, .. } => details,
        }
    }

    /// Build the wire-format error envelope (§6.2).
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
                "details": self.details(),
            }
        })
    }

    /// CLI exit code per §6.3: any error envelope maps to 1.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_envelope().serialize(serializer)
    }
}
