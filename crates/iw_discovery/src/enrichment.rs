//! Phase 0, pass 2: deep enrichment (§4.G). Delta-driven against a cache
//! keyed by `book_ref`; computes cover candidates and a `BookFingerprint`
//! for each book unit whose per-unit signature changed.

use crate::types::{BookFingerprint, EnrichedBook, EnrichmentState, UnitType, AUDIO_EXTENSIONS, COVER_EXTENSIONS};
use iw_canon::error::CoreError;
use iw_fs::{FileEntry, Jail, RelativePath, Root};
use std::collections::HashMap;

const CACHE_PATH: &str = "import_wizard/cache_v1.json";

/// 24 hex of SHA-256 over `source_root|rel_path` (§4.G).
pub fn book_ref(source_root: &str, rel_path: &str) -> String {
    let full = iw_canon::fingerprint_str(&format!("{}|{}", source_root, rel_path));
    full.chars().take(24).collect()
}

/// Enrichment cache: `book_ref -> EnrichedBook`, stored atomically at
/// `jobs:import_wizard/cache_v1.json`.
pub struct EnrichmentCache {
    jail: Jail,
    entries: HashMap<String, EnrichedBook>,
}

impl EnrichmentCache {
    fn path() -> RelativePath {
        RelativePath::parse(CACHE_PATH).expect("cache path is a safe literal")
    }

    pub fn load(jail: Jail) -> Result<Self, CoreError> {
        let rel = Self::path();
        let entries = if jail.exists(Root::Jobs, &rel) {
            let file = jail.open_read(Root::Jobs, &rel).map_err(|e| e.into_core_error(false))?;
            serde_json::from_reader(file).map_err(|e| CoreError::internal(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(Self { jail, entries })
    }

    fn persist(&self) -> Result<(), CoreError> {
        let v = serde_json::to_value(&self.entries).map_err(|e| CoreError::internal(e.to_string()))?;
        let bytes = iw_canon::canonical_json_bytes(&v)?;
        self.jail
            .write_atomic(Root::Jobs, &Self::path(), &bytes)
            .map_err(|e| e.into_core_error(false))
    }

    pub fn get(&self, book_ref: &str) -> Option<&EnrichedBook> {
        self.entries.get(book_ref)
    }

    /// Enrich `rel_path` under `source_root` unless the cache already holds
    /// an up-to-date `done` entry for its current `_sig`. Returns the
    /// (possibly cached) enriched record.
    pub fn enrich(
        &mut self,
        jail: &Jail,
        root: Root,
        source_root: &str,
        rel: &RelativePath,
        unit_type: UnitType,
    ) -> Result<EnrichedBook, CoreError> {
        let reference = book_ref(source_root, rel.as_str());
        let current_signature = unit_signature(jail, root, rel, unit_type)?;

        if let Some(cached) = self.entries.get(&reference) {
            if cached.signature == current_signature && cached.state == EnrichmentState::Done {
                return Ok(cached.clone());
            }
        }

        // Claim the slot before scanning: concurrent invocations are
        // excluded by `state=running`, persisted before the scan begins.
        let mut record = EnrichedBook {
            book_ref: reference.clone(),
            unit_type,
            signature: current_signature.clone(),
            state: EnrichmentState::Running,
            cover_candidates: Vec::new(),
            fingerprint: None,
        };
        self.entries.insert(reference.clone(), record.clone());
        self.persist()?;

        let scan_result = scan_unit(jail, root, rel, unit_type);
        match scan_result {
            Ok((covers, fingerprint)) => {
                record.state = EnrichmentState::Done;
                record.cover_candidates = covers;
                record.fingerprint = Some(fingerprint);
            }
            Err(e) => {
                record.state = EnrichmentState::Failed;
                tracing::warn!(book_ref = %reference, error = %e, "deep enrichment failed");
            }
        }
        self.entries.insert(reference.clone(), record.clone());
        self.persist()?;
        Ok(record)
    }
}

fn unit_signature(
    jail: &Jail,
    root: Root,
    rel: &RelativePath,
    unit_type: UnitType,
) -> Result<String, CoreError> {
    match unit_type {
        UnitType::File => {
            let stat = jail.stat(root, rel).map_err(|e| e.into_core_error(true))?;
            signature_row(&stat)
        }
        UnitType::Dir => {
            let entries = jail.list(root, rel, true).map_err(|e| e.into_core_error(true))?;
            let mut rows: Vec<String> = entries
                .iter()
                .filter(|e| !e.is_dir && is_media_file(&e.rel_path))
                .map(|e| signature_row(e).unwrap_or_default())
                .collect();
            rows.sort();
            Ok(iw_canon::fingerprint_str(&rows.join("")))
        }
    }
}

fn signature_row(entry: &FileEntry) -> Result<String, CoreError> {
    Ok(format!(
        "{}\n{}\n{}\n",
        entry.rel_path,
        entry.size.unwrap_or(0),
        entry.mtime.unwrap_or(0) * 1_000_000
    ))
}

fn is_media_file(rel_path: &str) -> bool {
    let lower = rel_path.to_ascii_lowercase();
    AUDIO_EXTENSIONS
        .iter()
        .chain(COVER_EXTENSIONS.iter())
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}

fn scan_unit(
    jail: &Jail,
    root: Root,
    rel: &RelativePath,
    unit_type: UnitType,
) -> Result<(Vec<String>, BookFingerprint), CoreError> {
    match unit_type {
        UnitType::File => {
            let stat = jail.stat(root, rel).map_err(|e| e.into_core_error(true))?;
            let value = iw_canon::fingerprint_str(&format!(
                "{}{}{}",
                stat.rel_path,
                stat.size.unwrap_or(0),
                stat.mtime.unwrap_or(0) * 1_000_000
            ));
            Ok((Vec::new(), BookFingerprint::basic(value)))
        }
        UnitType::Dir => {
            let entries = jail.list(root, rel, true).map_err(|e| e.into_core_error(true))?;
            let mut covers: Vec<String> = entries
                .iter()
                .filter(|e| !e.is_dir && has_cover_extension(&e.rel_path))
                .map(|e| e.rel_path.clone())
                .collect();
            covers.sort();

            let mut rows: Vec<String> = entries
                .iter()
                .filter(|e| !e.is_dir && is_media_file(&e.rel_path))
                .map(|e| signature_row(e).unwrap_or_default())
                .collect();
            rows.sort();
            let value = iw_canon::fingerprint_str(&rows.join(""));
            Ok((covers, BookFingerprint::basic(value)))
        }
    }
}

fn has_cover_extension(rel_path: &str) -> bool {
    let lower = rel_path.to_ascii_lowercase();
    COVER_EXTENSIONS.iter().any(|ext| lower.ends_with(&format!(".{}", ext)))
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
        fs::write(inbox.join("Author/Book/track01.mp3"), b"audio").unwrap();
        fs::write(inbox.join("Author/Book/cover.jpg"), b"img").unwrap();
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
    fn enrich_finds_cover_and_caches() {
        let (_tmp, jail) = jail();
        let mut cache = EnrichmentCache::load(jail.clone()).unwrap();
        let rel = RelativePath::parse("Author/Book").unwrap();
        let record = cache
            .enrich(&jail, Root::Inbox, "inbox", &rel, UnitType::Dir)
            .unwrap();
        assert_eq!(record.state, EnrichmentState::Done);
        assert_eq!(record.cover_candidates, vec!["Author/Book/cover.jpg".to_string()]);

        let reloaded = EnrichmentCache::load(jail).unwrap();
        assert!(reloaded.get(&record.book_ref).is_some());
    }

    #[test]
    fn book_ref_is_24_hex_chars() {
        let r = book_ref("inbox", "Author/Book");
        assert_eq!(r.len(), 24);
        assert!(r.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
