//! Single-writer lock on the patches root (§4.E, §5): exactly one process
//! may hold it; that process is the only writer to the queue and the
//! processed registry. Modeled on `casparian_db::lock`.

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("patches root is locked by another process: {0}")]
    Locked(PathBuf),
    #[error("failed to create lock file: {0}")]
    CreateFailed(#[source] io::Error),
    #[error("failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

/// Guard holding the exclusive lock; released on drop for the remainder of
/// the owning process's lifetime (§9 "held by the owning process for its
/// entire lifetime; child operations never re-acquire it").
pub struct PatchesRootLock {
    _file: File,
    lock_path: PathBuf,
    sidecar_path: PathBuf,
}

impl PatchesRootLock {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for PatchesRootLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.sidecar_path) {
            tracing::debug!(path = %self.sidecar_path.display(), error = %e, "failed to remove lock sidecar");
        }
    }
}

impl std::fmt::Debug for PatchesRootLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchesRootLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

#[derive(Serialize)]
struct LockSidecar {
    pid: u32,
    exe: Option<String>,
    timestamp: String,
}

pub fn lock_path_for(patches_root: &Path) -> PathBuf {
    patches_root.join(".import_wizard.lock")
}

fn write_sidecar(lock_path: &Path) -> PathBuf {
    let sidecar_path = lock_path.with_extension("lock.json");
    let sidecar = LockSidecar {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        timestamp: Utc::now().to_rfc3339(),
    };
    if let Ok(payload) = serde_json::to_vec_pretty(&sidecar) {
        let _ = fs::write(&sidecar_path, payload);
    }
    sidecar_path
}

/// Non-blocking: returns `Err(LockError::Locked)` immediately if another
/// process already holds the lock.
pub fn try_lock_patches_root(patches_root: &Path) -> Result<PatchesRootLock, LockError> {
    fs::create_dir_all(patches_root).map_err(LockError::CreateFailed)?;
    let lock_path = lock_path_for(patches_root);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(LockError::CreateFailed)?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            let sidecar_path = write_sidecar(&lock_path);
            Ok(PatchesRootLock {
                _file: file,
                lock_path,
                sidecar_path,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Err(LockError::Locked(patches_root.to_path_buf()))
        }
        Err(e) => Err(LockError::AcquireFailed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_lock_attempt_fails() {
        let tmp = TempDir::new().unwrap();
        let _guard = try_lock_patches_root(tmp.path()).unwrap();
        let second = try_lock_patches_root(tmp.path());
        assert!(matches!(second, Err(LockError::Locked(_))));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        {
            let _guard = try_lock_patches_root(tmp.path()).unwrap();
        }
        let _guard2 = try_lock_patches_root(tmp.path()).unwrap();
    }
}
