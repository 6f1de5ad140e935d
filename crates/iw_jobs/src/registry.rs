//! Processed registry (component F, §4.F): exactly-once admission of book
//! identity keys. Stored as a sorted JSON array of `"algo:value"` strings
//! at `import/processed/processed_registry.json` under the Wizards root
//! (§6.1), modeled on `plugins/import/processed_registry`.

use iw_canon::error::CoreError;
use iw_fs::{Jail, RelativePath, Root};
use std::collections::HashSet;
use std::sync::Mutex;

const REGISTRY_PATH: &str = "import/processed/processed_registry.json";

pub fn identity_key(algo: &str, value: &str) -> String {
    format!("{}:{}", algo, value)
}

pub struct ProcessedRegistry {
    jail: Jail,
    keys: Mutex<HashSet<String>>,
}

impl ProcessedRegistry {
    fn path() -> RelativePath {
        RelativePath::parse(REGISTRY_PATH).expect("registry path is a safe literal")
    }

    pub fn load(jail: Jail) -> Result<Self, CoreError> {
        let rel = Self::path();
        let keys = if jail.exists(Root::Wizards, &rel) {
            let file = jail
                .open_read(Root::Wizards, &rel)
                .map_err(|e| e.into_core_error(false))?;
            let list: Vec<String> =
                serde_json::from_reader(file).map_err(|e| CoreError::internal(e.to_string()))?;
            list.into_iter().collect()
        } else {
            HashSet::new()
        };
        Ok(Self {
            jail,
            keys: Mutex::new(keys),
        })
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.keys.lock().expect("registry lock poisoned").contains(key)
    }

    /// Admit a key. Idempotent: marking twice is a no-op (§8 property 6).
    /// Admission happens only after the owning job reaches SUCCEEDED; the
    /// caller is responsible for that ordering.
    pub fn mark(&self, key: &str) -> Result<(), CoreError> {
        let mut keys = self.keys.lock().expect("registry lock poisoned");
        if keys.insert(key.to_string()) {
            self.persist(&keys)?;
        }
        Ok(())
    }

    /// Operator correction path: present in the original, silent in the
    /// distilled summary table but explicit in the lifecycle note "never
    /// removed except by explicit unmark".
    pub fn unmark(&self, key: &str) -> Result<(), CoreError> {
        let mut keys = self.keys.lock().expect("registry lock poisoned");
        if keys.remove(key) {
            self.persist(&keys)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> usize {
        self.keys.lock().expect("registry lock poisoned").len()
    }

    /// Sorted ascending (§8 property 9).
    pub fn list(&self) -> Vec<String> {
        let mut list: Vec<String> = self
            .keys
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .cloned()
            .collect();
        list.sort();
        list
    }

    fn persist(&self, keys: &HashSet<String>) -> Result<(), CoreError> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        let v = serde_json::to_value(&sorted).map_err(|e| CoreError::internal(e.to_string()))?;
        let bytes = iw_canon::canonical_json_bytes(&v)?;
        self.jail
            .write_atomic(Root::Wizards, &Self::path(), &bytes)
            .map_err(|e| e.into_core_error(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iw_fs::RootPaths;
    use tempfile::TempDir;

    fn jail() -> (TempDir, Jail) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("jobs")).unwrap();
        let roots = RootPaths::new(
            tmp.path().join("inbox"),
            tmp.path().join("stage"),
            tmp.path().join("jobs"),
            tmp.path().join("outbox"),
            tmp.path().join("config"),
            tmp.path().join("wizards"),
        );
        (tmp, Jail::new(roots, None))
    }

    #[test]
    fn mark_is_idempotent_and_listing_is_sorted() {
        let (_tmp, jail) = jail();
        let registry = ProcessedRegistry::load(jail.clone()).unwrap();
        registry.mark(&identity_key("sha256", "bbb")).unwrap();
        registry.mark(&identity_key("sha256", "aaa")).unwrap();
        registry.mark(&identity_key("sha256", "bbb")).unwrap();
        assert_eq!(registry.stats(), 2);
        assert_eq!(
            registry.list(),
            vec!["sha256:aaa".to_string(), "sha256:bbb".to_string()]
        );

        let reloaded = ProcessedRegistry::load(jail).unwrap();
        assert!(reloaded.is_processed("sha256:aaa"));
    }

    #[test]
    fn unmark_removes_entry() {
        let (_tmp, jail) = jail();
        let registry = ProcessedRegistry::load(jail).unwrap();
        let key = identity_key("sha256", "ccc");
        registry.mark(&key).unwrap();
        assert!(registry.is_processed(&key));
        registry.unmark(&key).unwrap();
        assert!(!registry.is_processed(&key));
    }
}
