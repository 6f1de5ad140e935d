//! `RelativePath` normalization (§3): POSIX-style, no leading slash, no
//! `..` components, backslashes folded to `/`.

use crate::error::{FsError, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativePath(String);

impl RelativePath {
    /// Normalize and validate a caller-supplied path string. Rejects
    /// absolute paths and any `..` component; folds `\` to `/`; collapses
    /// repeated separators; drops a trailing `/`.
    pub fn parse(raw: &str) -> Result<Self> {
        let folded = raw.replace('\\', "/");
        if folded.starts_with('/') {
            return Err(FsError::InvalidPath(raw.to_string()));
        }
        let mut parts = Vec::new();
        for segment in folded.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                return Err(FsError::InvalidPath(raw.to_string()));
            }
            parts.push(segment);
        }
        Ok(Self(parts.join("/")))
    }

    /// The empty relative path: the root itself.
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn join(&self, segment: &str) -> Result<Self> {
        if self.0.is_empty() {
            Self::parse(segment)
        } else {
            Self::parse(&format!("{}/{}", self.0, segment))
        }
    }

    pub fn file_stem(&self) -> Option<&str> {
        let name = self.0.rsplit('/').next()?;
        name.rsplit_once('.').map(|(stem, _)| stem).or(Some(name))
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_traversal() {
        assert!(RelativePath::parse("a/../b").is_err());
        assert!(RelativePath::parse("..").is_err());
    }

    #[test]
    fn rejects_absolute() {
        assert!(RelativePath::parse("/etc/passwd").is_err());
    }

    #[test]
    fn folds_backslashes() {
        let p = RelativePath::parse("Author\\Book\\track01.mp3").unwrap();
        assert_eq!(p.as_str(), "Author/Book/track01.mp3");
    }

    #[test]
    fn collapses_dot_segments() {
        let p = RelativePath::parse("./Author//Book/./track.mp3").unwrap();
        assert_eq!(p.as_str(), "Author/Book/track.mp3");
    }
}
