//! Phase 0, pass 1: the fast index (§4.G). Bounded at two directory
//! levels; classifies each root-level item and derives `(author, book,
//! relative_path)` tuples for the wizard's author/book selection steps.

use crate::types::{classify_bundle_suffix, item_id, Classification, DiscoveryItem, ItemKind, UnitType};
use iw_canon::error::CoreError;
use iw_fs::{Jail, RelativePath, Root};
use serde_json::json;

#[derive(Debug, Clone)]
pub struct AuthorBookTuple {
    pub author: String,
    pub book: String,
    pub relative_path: String,
    pub unit_type: UnitType,
}

#[derive(Debug, Clone)]
pub struct FastIndexResult {
    pub signature: String,
    pub items: Vec<DiscoveryItem>,
    pub tuples: Vec<AuthorBookTuple>,
}

/// Run the bounded, two-level fast index over `root` at `rel` (typically
/// the Inbox root).
pub fn fast_index(jail: &Jail, root: Root, rel: &RelativePath) -> Result<FastIndexResult, CoreError> {
    let level1 = jail
        .list(root, rel, false)
        .map_err(|e| e.into_core_error(true))?;

    let mut items = Vec::new();
    let mut tuples = Vec::new();
    let mut signature_rows = Vec::new();

    for entry in &level1 {
        signature_rows.push(json!({
            "rel_path": entry.rel_path,
            "is_dir": entry.is_dir,
            "size": entry.size,
            "mtime": entry.mtime,
        }));

        let entry_rel = RelativePath::parse(&entry.rel_path).map_err(|e| e.into_core_error(true))?;
        let name = entry.rel_path.rsplit('/').next().unwrap_or(&entry.rel_path);

        if entry.is_dir {
            let level2 = jail
                .list(root, &entry_rel, false)
                .map_err(|e| e.into_core_error(true))?;
            let has_subdirs = level2.iter().any(|c| c.is_dir);

            if has_subdirs {
                items.push(discovery_item(root, &entry_rel, ItemKind::Dir));
                for book_entry in level2.iter() {
                    let book_name = book_entry.rel_path.rsplit('/').next().unwrap_or(&book_entry.rel_path);
                    let unit_type = if book_entry.is_dir { UnitType::Dir } else { UnitType::File };
                    if !book_entry.is_dir && !is_book_candidate(book_name) {
                        continue;
                    }
                    tuples.push(AuthorBookTuple {
                        author: name.to_string(),
                        book: book_name.to_string(),
                        relative_path: book_entry.rel_path.clone(),
                        unit_type,
                    });
                }
            } else {
                items.push(discovery_item(root, &entry_rel, ItemKind::Dir));
                tuples.push(AuthorBookTuple {
                    author: String::new(),
                    book: name.to_string(),
                    relative_path: entry.rel_path.clone(),
                    unit_type: UnitType::Dir,
                });
            }
        } else {
            let classification = classify_file(name);
            let kind = match classification {
                Classification::ContainerZip | Classification::ContainerRar => ItemKind::Bundle,
                _ => ItemKind::File,
            };
            items.push(discovery_item(root, &entry_rel, kind));

            // A lone audio file or archive sitting directly at the root
            // (no author directory above it) is itself a book unit (§4.G,
            // GLOSSARY "Book unit").
            if matches!(kind, ItemKind::File | ItemKind::Bundle) && is_book_candidate(name) {
                tuples.push(AuthorBookTuple {
                    author: String::new(),
                    book: file_stem(name),
                    relative_path: entry.rel_path.clone(),
                    unit_type: UnitType::File,
                });
            }
        }
    }

    let signature = iw_canon::fingerprint_json(&json!(signature_rows))?;

    Ok(FastIndexResult {
        signature,
        items,
        tuples,
    })
}

/// Whether a bare file (no enclosing book directory) is itself importable
/// as a file-unit book: a single audio track or an archive (§4.G, GLOSSARY).
fn is_book_candidate(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if classify_bundle_suffix(name).is_some() || lower.ends_with(".rar") {
        return true;
    }
    crate::types::AUDIO_EXTENSIONS.iter().any(|ext| lower.ends_with(&format!(".{}", ext)))
}

fn file_stem(name: &str) -> String {
    classify_bundle_suffix(name)
        .map(|suffix| name[..name.len() - suffix.len()].to_string())
        .unwrap_or_else(|| {
            std::path::Path::new(name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(name)
                .to_string()
        })
}

fn classify_file(name: &str) -> Classification {
    if let Some(suffix) = classify_bundle_suffix(name) {
        return if suffix == ".rar" {
            Classification::ContainerRar
        } else {
            Classification::ContainerZip
        };
    }
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".rar") {
        return Classification::ContainerRar;
    }
    let is_audio = crate::types::AUDIO_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)));
    if is_audio {
        Classification::AudioFile
    } else {
        Classification::OtherFile
    }
}

fn discovery_item(root: Root, rel: &RelativePath, kind: ItemKind) -> DiscoveryItem {
    DiscoveryItem {
        item_id: item_id(root.as_str(), rel.as_str()),
        root: root.as_str().to_string(),
        relative_path: rel.as_str().to_string(),
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iw_fs::RootPaths;
    use std::fs;
    use tempfile::TempDir;

    fn jail() -> (TempDir, Jail) {
        let tmp = TempDir::new().unwrap();
        let inbox = tmp.path().join("inbox");
        fs::create_dir_all(inbox.join("Author/Book")).unwrap();
        fs::write(inbox.join("Author/Book/track01.mp3"), b"x").unwrap();
        fs::create_dir_all(inbox.join("LeafBook")).unwrap();
        fs::write(inbox.join("LeafBook/track01.mp3"), b"y").unwrap();
        fs::write(inbox.join("archive.zip"), b"z").unwrap();
        let roots = RootPaths::new(
            inbox,
            tmp.path().join("stage"),
            tmp.path().join("jobs"),
            tmp.path().join("outbox"),
            tmp.path().join("config"),
            tmp.path().join("wizards"),
        );
        (tmp, Jail::new(roots, None))
    }

    #[test]
    fn classifies_author_and_leaf_layouts() {
        let (_tmp, jail) = jail();
        let result = fast_index(&jail, Root::Inbox, &RelativePath::root()).unwrap();
        // "Author/Book" (dir unit), "LeafBook" (dir unit), and the bare
        // "archive.zip" (file unit, no author) all resolve to book tuples.
        assert_eq!(result.tuples.len(), 3);
        let author_tuple = result.tuples.iter().find(|t| t.author == "Author").unwrap();
        assert_eq!(author_tuple.book, "Book");
        assert_eq!(author_tuple.unit_type, UnitType::Dir);
        let leaf_tuple = result.tuples.iter().find(|t| t.book == "LeafBook").unwrap();
        assert_eq!(leaf_tuple.unit_type, UnitType::Dir);
        let archive_tuple = result.tuples.iter().find(|t| t.book == "archive").unwrap();
        assert!(archive_tuple.author.is_empty());
        assert_eq!(archive_tuple.unit_type, UnitType::File);
    }

    #[test]
    fn signature_is_stable_for_same_tree() {
        let (_tmp, jail) = jail();
        let first = fast_index(&jail, Root::Inbox, &RelativePath::root()).unwrap();
        let second = fast_index(&jail, Root::Inbox, &RelativePath::root()).unwrap();
        assert_eq!(first.signature, second.signature);
    }
}
