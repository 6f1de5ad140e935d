//! Resource-layer errors (§4.B, §10.3). Converted to `CoreError` at the
//! jail's call boundary: user-path-caused failures become `Validation`,
//! placement bugs in the core's own code become `Internal`.

use iw_canon::error::CoreError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("path escapes its root: {0}")]
    EscapesRoot(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(String),
}

impl FsError {
    /// Bad input from the caller (untrusted path, nonexistent target the
    /// caller should have known about) maps to `VALIDATION_ERROR`; anything
    /// that implies the core placed a file where it shouldn't have maps to
    /// `INTERNAL_ERROR` (§7).
    pub fn into_core_error(self, caused_by_user_input: bool) -> CoreError {
        let message = self.to_string();
        match (&self, caused_by_user_input) {
            (FsError::EscapesRoot(_), _) | (FsError::InvalidPath(_), _) => {
                CoreError::validation("$.path", "invalid_path", message)
            }
            (_, true) => CoreError::validation("$.path", "resource_error", message),
            (_, false) => CoreError::internal(message),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(e.to_string()),
            _ => FsError::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
