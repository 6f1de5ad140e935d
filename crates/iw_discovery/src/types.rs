//! Discovery data types (§3, §4.G).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Dir,
    File,
    Bundle,
}

/// Root-item classification from the fast index pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    AuthorDir,
    BookDir,
    AudioFile,
    ContainerZip,
    ContainerRar,
    OtherFile,
}

pub const BUNDLE_SUFFIXES: &[&str] = &[".tar.gz", ".tar.bz2", ".tgz", ".tar", ".zip"];
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "m4b", "flac", "wav", "ogg", "opus"];
pub const COVER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// `root:<R>|path:<P>` item id per §3.
pub fn item_id(root: &str, relative_path: &str) -> String {
    format!("root:{}|path:{}", root, relative_path)
}

/// Longest-suffix match over the bundle suffix table.
pub fn classify_bundle_suffix(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    BUNDLE_SUFFIXES
        .iter()
        .filter(|suffix| lower.ends_with(*suffix))
        .max_by_key(|suffix| suffix.len())
        .copied()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryItem {
    pub item_id: String,
    pub root: String,
    pub relative_path: String,
    pub kind: ItemKind,
}

/// Unit fingerprint per §4.G: dir units hash a sorted manifest of
/// `(rel_path, size, mtime_us)`; file units hash their own triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookFingerprint {
    pub algo: String,
    pub value: String,
    pub strength: String,
}

impl BookFingerprint {
    pub fn basic(value: String) -> Self {
        Self {
            algo: "sha256".to_string(),
            value,
            strength: "basic".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    Dir,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentState {
    Idle,
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedBook {
    pub book_ref: String,
    pub unit_type: UnitType,
    pub signature: String,
    pub state: EnrichmentState,
    pub cover_candidates: Vec<String>,
    pub fingerprint: Option<BookFingerprint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_suffix_prefers_longest_match() {
        assert_eq!(classify_bundle_suffix("Book.tar.gz"), Some(".tar.gz"));
        assert_eq!(classify_bundle_suffix("Book.tgz"), Some(".tgz"));
        assert_eq!(classify_bundle_suffix("Book.zip"), Some(".zip"));
        assert_eq!(classify_bundle_suffix("Book.mp3"), None);
    }
}
