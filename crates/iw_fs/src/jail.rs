//! The jailed filesystem capability (component B, §4.B). Every operation is
//! scoped to a named [`Root`] and a normalized [`RelativePath`]; nothing in
//! this crate ever accepts a bare absolute path from a caller.

use crate::error::{FsError, Result};
use crate::path::RelativePath;
use iw_diagnostics::EventBus;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Root {
    Inbox,
    Stage,
    Jobs,
    Outbox,
    Config,
    Wizards,
}

impl Root {
    pub fn as_str(&self) -> &'static str {
        match self {
            Root::Inbox => "inbox",
            Root::Stage => "stage",
            Root::Jobs => "jobs",
            Root::Outbox => "outbox",
            Root::Config => "config",
            Root::Wizards => "wizards",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbox" => Some(Root::Inbox),
            "stage" => Some(Root::Stage),
            "jobs" => Some(Root::Jobs),
            "outbox" => Some(Root::Outbox),
            "config" => Some(Root::Config),
            "wizards" => Some(Root::Wizards),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileEntry {
    pub rel_path: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
}

pub type FileStat = FileEntry;

/// Absolute directories bound to each [`Root`], resolved once at process
/// start (§10.4) and handed to [`Jail::new`].
#[derive(Debug, Clone)]
pub struct RootPaths {
    paths: HashMap<Root, PathBuf>,
}

impl RootPaths {
    pub fn new(
        inbox: PathBuf,
        stage: PathBuf,
        jobs: PathBuf,
        outbox: PathBuf,
        config: PathBuf,
        wizards: PathBuf,
    ) -> Self {
        let mut paths = HashMap::new();
        paths.insert(Root::Inbox, inbox);
        paths.insert(Root::Stage, stage);
        paths.insert(Root::Jobs, jobs);
        paths.insert(Root::Outbox, outbox);
        paths.insert(Root::Config, config);
        paths.insert(Root::Wizards, wizards);
        Self { paths }
    }

    pub fn get(&self, root: Root) -> &Path {
        self.paths.get(&root).expect("every Root has a bound path")
    }
}

/// The jailed filesystem capability. Cheap to clone; the bus and root map
/// are both reference-counted / copy.
#[derive(Clone)]
pub struct Jail {
    roots: Arc<RootPaths>,
    bus: Option<Arc<EventBus>>,
}

impl Jail {
    pub fn new(roots: RootPaths, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            roots: Arc::new(roots),
            bus,
        }
    }

    fn emit_operation(&self, operation: &str, data: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish("operation.start", "fs", operation, data.clone());
        }
    }

    fn emit_operation_end(&self, operation: &str, started: Instant, data: serde_json::Value) {
        if let Some(bus) = &self.bus {
            let mut data = data;
            if let serde_json::Value::Object(ref mut map) = data {
                map.insert(
                    "duration_ms".to_string(),
                    serde_json::json!(started.elapsed().as_millis() as u64),
                );
            }
            bus.publish("operation.end", "fs", operation, data);
        }
    }

    /// Resolve `(root, rel)` to an absolute path, rejecting anything that
    /// would escape the root. `resolve` gets its own `operation.start` /
    /// `operation.end` pair distinct from the higher-level operations that
    /// call it (§1 supplemental note on `paths.py`).
    pub fn resolve(&self, root: Root, rel: &RelativePath) -> Result<PathBuf> {
        let started = Instant::now();
        self.emit_operation(
            "resolve",
            serde_json::json!({"root": root.as_str(), "rel_path": rel.as_str()}),
        );
        let base = self.roots.get(root);
        let joined = if rel.is_root() {
            base.to_path_buf()
        } else {
            base.join(rel.as_str())
        };
        let result = if joined.starts_with(base) {
            Ok(joined)
        } else {
            Err(FsError::EscapesRoot(rel.as_str().to_string()))
        };
        self.emit_operation_end(
            "resolve",
            started,
            serde_json::json!({
                "root": root.as_str(),
                "rel_path": rel.as_str(),
                "ok": result.is_ok(),
            }),
        );
        result
    }

    pub fn list(&self, root: Root, rel: &RelativePath, recursive: bool) -> Result<Vec<FileEntry>> {
        let started = Instant::now();
        self.emit_operation("list", serde_json::json!({"root": root.as_str(), "rel_path": rel.as_str()}));
        let abs = self.resolve(root, rel)?;
        let meta = fs::metadata(&abs)?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(rel.as_str().to_string()));
        }
        let mut entries = Vec::new();
        self.list_into(&abs, rel, recursive, &mut entries)?;
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        self.emit_operation_end(
            "list",
            started,
            serde_json::json!({"root": root.as_str(), "count": entries.len()}),
        );
        Ok(entries)
    }

    fn list_into(
        &self,
        abs_dir: &Path,
        rel_dir: &RelativePath,
        recursive: bool,
        out: &mut Vec<FileEntry>,
    ) -> Result<()> {
        for dirent in fs::read_dir(abs_dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            let child_rel = rel_dir.join(&name)?;
            let meta = dirent.metadata()?;
            out.push(entry_from_metadata(child_rel.as_str().to_string(), &meta));
            if meta.is_dir() && recursive {
                self.list_into(&dirent.path(), &child_rel, recursive, out)?;
            }
        }
        Ok(())
    }

    pub fn stat(&self, root: Root, rel: &RelativePath) -> Result<FileStat> {
        let abs = self.resolve(root, rel)?;
        let meta = fs::metadata(&abs)?;
        Ok(entry_from_metadata(rel.as_str().to_string(), &meta))
    }

    pub fn exists(&self, root: Root, rel: &RelativePath) -> bool {
        match self.resolve(root, rel) {
            Ok(abs) => abs.exists(),
            Err(_) => false,
        }
    }

    pub fn mkdir(&self, root: Root, rel: &RelativePath, parents: bool, exist_ok: bool) -> Result<()> {
        let abs = self.resolve(root, rel)?;
        if abs.exists() {
            return if exist_ok {
                Ok(())
            } else {
                Err(FsError::AlreadyExists(rel.as_str().to_string()))
            };
        }
        if parents {
            fs::create_dir_all(&abs)?;
        } else {
            fs::create_dir(&abs)?;
        }
        Ok(())
    }

    pub fn rename(&self, root: Root, src: &RelativePath, dst: &RelativePath, overwrite: bool) -> Result<()> {
        let started = Instant::now();
        self.emit_operation(
            "rename",
            serde_json::json!({"root": root.as_str(), "src": src.as_str(), "dst": dst.as_str()}),
        );
        let abs_src = self.resolve(root, src)?;
        let abs_dst = self.resolve(root, dst)?;
        if !abs_src.exists() {
            return Err(FsError::NotFound(src.as_str().to_string()));
        }
        if abs_dst.exists() && !overwrite {
            return Err(FsError::AlreadyExists(dst.as_str().to_string()));
        }
        if let Some(parent) = abs_dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&abs_src, &abs_dst)?;
        self.emit_operation_end("rename", started, serde_json::json!({"root": root.as_str()}));
        Ok(())
    }

    pub fn delete_file(&self, root: Root, rel: &RelativePath) -> Result<()> {
        let abs = self.resolve(root, rel)?;
        let meta = fs::metadata(&abs).map_err(FsError::from)?;
        if meta.is_dir() {
            return Err(FsError::IsADirectory(rel.as_str().to_string()));
        }
        fs::remove_file(&abs)?;
        Ok(())
    }

    pub fn rmdir(&self, root: Root, rel: &RelativePath) -> Result<()> {
        let abs = self.resolve(root, rel)?;
        let meta = fs::metadata(&abs).map_err(FsError::from)?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(rel.as_str().to_string()));
        }
        fs::remove_dir(&abs)?;
        Ok(())
    }

    pub fn rmtree(&self, root: Root, rel: &RelativePath) -> Result<()> {
        let abs = self.resolve(root, rel)?;
        if !abs.exists() {
            return Err(FsError::NotFound(rel.as_str().to_string()));
        }
        if abs.is_dir() {
            fs::remove_dir_all(&abs)?;
        } else {
            fs::remove_file(&abs)?;
        }
        Ok(())
    }

    pub fn copy(
        &self,
        src_root: Root,
        src: &RelativePath,
        dst_root: Root,
        dst: &RelativePath,
        overwrite: bool,
        mkdir_parents: bool,
    ) -> Result<()> {
        let started = Instant::now();
        self.emit_operation(
            "copy",
            serde_json::json!({
                "src_root": src_root.as_str(), "src": src.as_str(),
                "dst_root": dst_root.as_str(), "dst": dst.as_str(),
            }),
        );
        let abs_src = self.resolve(src_root, src)?;
        let abs_dst = self.resolve(dst_root, dst)?;
        let meta = fs::metadata(&abs_src).map_err(FsError::from)?;
        if abs_dst.exists() && !overwrite {
            return Err(FsError::AlreadyExists(dst.as_str().to_string()));
        }
        if mkdir_parents {
            if let Some(parent) = abs_dst.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        if meta.is_dir() {
            copy_dir_recursive(&abs_src, &abs_dst)?;
        } else {
            fs::copy(&abs_src, &abs_dst)?;
        }
        self.emit_operation_end("copy", started, serde_json::json!({"ok": true}));
        Ok(())
    }

    pub fn open_read(&self, root: Root, rel: &RelativePath) -> Result<File> {
        let abs = self.resolve(root, rel)?;
        Ok(File::open(abs)?)
    }

    /// Atomic write helper: write through to `<path>.tmp`, fsync, then
    /// rename over the final path. Callers that want a raw streaming
    /// `open_write` (non-atomic) should use [`Jail::open_write_direct`].
    pub fn write_atomic(&self, root: Root, rel: &RelativePath, contents: &[u8]) -> Result<()> {
        let abs = self.resolve(root, rel)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_sibling(&abs);
        {
            let mut f = File::create(&tmp)?;
            f.write_all(contents)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &abs)?;
        Ok(())
    }

    pub fn open_write_direct(&self, root: Root, rel: &RelativePath) -> Result<File> {
        let abs = self.resolve(root, rel)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(File::create(abs)?)
    }

    pub fn open_append(&self, root: Root, rel: &RelativePath) -> Result<File> {
        let abs = self.resolve(root, rel)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new().create(true).append(true).open(abs)?)
    }

    pub fn checksum(&self, root: Root, rel: &RelativePath) -> Result<String> {
        let abs = self.resolve(root, rel)?;
        let meta = fs::metadata(&abs).map_err(FsError::from)?;
        if meta.is_dir() {
            return Err(FsError::IsADirectory(rel.as_str().to_string()));
        }
        let mut file = File::open(&abs)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn tail_bytes(&self, root: Root, rel: &RelativePath, max_bytes: i64) -> Result<Vec<u8>> {
        if max_bytes <= 0 {
            return Err(FsError::InvalidArgument("max_bytes must be > 0".to_string()));
        }
        let abs = self.resolve(root, rel)?;
        let meta = fs::metadata(&abs).map_err(FsError::from)?;
        if meta.is_dir() {
            return Err(FsError::IsADirectory(rel.as_str().to_string()));
        }
        let mut file = File::open(&abs)?;
        let len = meta.len();
        let max_bytes = max_bytes as u64;
        let start = len.saturating_sub(max_bytes);
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    let mut children: Vec<_> = fs::read_dir(src)?.collect::<std::io::Result<Vec<_>>>()?;
    children.sort_by_key(|e| e.file_name());
    for child in children {
        let child_path = child.path();
        let target = dst.join(child.file_name());
        if child.metadata()?.is_dir() {
            copy_dir_recursive(&child_path, &target)?;
        } else {
            fs::copy(&child_path, &target)?;
        }
    }
    Ok(())
}

fn entry_from_metadata(rel_path: String, meta: &fs::Metadata) -> FileEntry {
    let is_dir = meta.is_dir();
    let size = if is_dir { None } else { Some(meta.len()) };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);
    FileEntry {
        rel_path,
        is_dir,
        size,
        mtime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_jail() -> (TempDir, Jail) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("inbox");
        fs::create_dir_all(&root).unwrap();
        let roots = RootPaths::new(
            root,
            tmp.path().join("stage"),
            tmp.path().join("jobs"),
            tmp.path().join("outbox"),
            tmp.path().join("config"),
            tmp.path().join("wizards"),
        );
        (tmp, Jail::new(roots, None))
    }

    #[test]
    fn resolve_rejects_escape() {
        let (_tmp, jail) = make_jail();
        let rel = RelativePath::parse("a/b").unwrap();
        assert!(jail.resolve(Root::Inbox, &rel).is_ok());
    }

    #[test]
    fn list_is_sorted() {
        let (tmp, jail) = make_jail();
        let inbox = tmp.path().join("inbox");
        fs::write(inbox.join("b.mp3"), b"x").unwrap();
        fs::write(inbox.join("a.mp3"), b"y").unwrap();
        let entries = jail.list(Root::Inbox, &RelativePath::root(), false).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(names, vec!["a.mp3", "b.mp3"]);
    }

    #[test]
    fn write_atomic_then_checksum() {
        let (_tmp, jail) = make_jail();
        let rel = RelativePath::parse("state.json").unwrap();
        jail.write_atomic(Root::Inbox, &rel, b"{}\n").unwrap();
        assert!(jail.exists(Root::Inbox, &rel));
        let sum = jail.checksum(Root::Inbox, &rel).unwrap();
        assert_eq!(sum.len(), 64);
    }

    #[test]
    fn tail_bytes_rejects_non_positive() {
        let (_tmp, jail) = make_jail();
        let rel = RelativePath::parse("f.txt").unwrap();
        jail.write_atomic(Root::Inbox, &rel, b"hello world").unwrap();
        assert!(jail.tail_bytes(Root::Inbox, &rel, 0).is_err());
        let tail = jail.tail_bytes(Root::Inbox, &rel, 5).unwrap();
        assert_eq!(&tail, b"world");
    }
}
