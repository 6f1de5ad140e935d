//! Job store and job service (component D, §4.D): persisted jobs with a
//! closed state machine, an append-only per-job log, and the idempotency
//! map that backs `start_processing`'s exactly-once guarantee.

use iw_canon::error::CoreError;
use iw_diagnostics::EventBus;
use iw_fs::{Jail, RelativePath, Root};
use iw_ids::JobId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Process,
    Import,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMeta {
    pub source: Option<String>,
    pub session_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub job_requests_path: Option<String>,
    pub run_id: Option<String>,
    pub book_rel_path: Option<String>,
    pub mode: Option<String>,
    pub unit_type: Option<String>,
    pub decision_json: Option<serde_json::Value>,
    pub retry_of: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub state: JobState,
    pub meta: JobMeta,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub return_code: Option<i32>,
    pub error: Option<String>,
    pub progress: f64,
}

impl JobRecord {
    pub fn new(job_type: JobType, meta: JobMeta) -> Self {
        Self {
            job_id: JobId::new(),
            job_type,
            state: JobState::Pending,
            meta,
            created_at: now_iso(),
            started_at: None,
            finished_at: None,
            return_code: None,
            error: None,
            progress: 0.0,
        }
    }

    /// Only `PENDING -> *` and `RUNNING -> *` transitions are legal
    /// (§4.D). Anything else is `ILLEGAL_TRANSITION`.
    pub fn transition(&mut self, to: JobState) -> Result<(), CoreError> {
        let legal = matches!(
            (self.state, to),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        );
        if !legal {
            return Err(CoreError::invariant_reason(
                "illegal_transition",
                format!("cannot transition job {:?} -> {:?}", self.state, to),
            ));
        }
        match to {
            JobState::Running => self.started_at = Some(now_iso()),
            JobState::Succeeded | JobState::Failed | JobState::Cancelled => {
                self.finished_at = Some(now_iso())
            }
            JobState::Pending => {}
        }
        self.state = to;
        Ok(())
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn job_json_path(job_id: &JobId) -> RelativePath {
    RelativePath::parse(&format!("{}.json", job_id.as_str())).expect("job id is a safe path segment")
}

fn job_log_path(job_id: &JobId) -> RelativePath {
    RelativePath::parse(&format!("{}.log", job_id.as_str())).expect("job id is a safe path segment")
}

/// Flat directory under the Jobs root: `<job_id>.json` + `<job_id>.log`.
pub struct JobStore {
    jail: Jail,
}

impl JobStore {
    pub fn new(jail: Jail) -> Self {
        Self { jail }
    }

    pub fn save(&self, job: &JobRecord) -> Result<(), CoreError> {
        let v = serde_json::to_value(job).map_err(|e| CoreError::internal(e.to_string()))?;
        let bytes = iw_canon::canonical_json_bytes(&v)?;
        self.jail
            .write_atomic(Root::Jobs, &job_json_path(&job.job_id), &bytes)
            .map_err(|e| e.into_core_error(false))
    }

    pub fn load(&self, job_id: &JobId) -> Result<JobRecord, CoreError> {
        let path = job_json_path(job_id);
        let file = self
            .jail
            .open_read(Root::Jobs, &path)
            .map_err(|e| e.into_core_error(true))?;
        serde_json::from_reader(file).map_err(|e| CoreError::internal(e.to_string()))
    }

    pub fn append_log(&self, job_id: &JobId, line: &str) -> Result<(), CoreError> {
        let mut file = self
            .jail
            .open_append(Root::Jobs, &job_log_path(job_id))
            .map_err(|e| e.into_core_error(false))?;
        writeln!(file, "{}", line).map_err(|e| CoreError::internal(e.to_string()))
    }

    /// Every `<job_id>.json` under the Jobs root, sorted by job id
    /// descending mtime, ties broken by id (§4.D). mtime is read from the
    /// jail's listing; ties fall back to lexicographic job id.
    pub fn list(&self) -> Result<Vec<JobRecord>, CoreError> {
        let entries = self
            .jail
            .list(Root::Jobs, &RelativePath::root(), false)
            .map_err(|e| e.into_core_error(false))?;
        let mut jobs = Vec::new();
        for entry in entries {
            if !entry.rel_path.ends_with(".json") {
                continue;
            }
            let rel = RelativePath::parse(&entry.rel_path).map_err(|e| e.into_core_error(false))?;
            let file = self
                .jail
                .open_read(Root::Jobs, &rel)
                .map_err(|e| e.into_core_error(false))?;
            if let Ok(job) = serde_json::from_reader::<_, JobRecord>(file) {
                jobs.push((entry.mtime.unwrap_or(0), job));
            }
        }
        jobs.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.job_id.as_str().cmp(a.1.job_id.as_str())));
        Ok(jobs.into_iter().map(|(_, j)| j).collect())
    }
}

/// Idempotency map persisted at `wizards:import/sessions/<sid>/idempotency.json`.
pub struct IdempotencyMap {
    jail: Jail,
    session_id: String,
    cache: Mutex<HashMap<String, String>>,
}

impl IdempotencyMap {
    fn path(session_id: &str) -> RelativePath {
        RelativePath::parse(&format!("import/sessions/{}/idempotency.json", session_id))
            .expect("session id is a safe path segment")
    }

    pub fn load(jail: Jail, session_id: &str) -> Result<Self, CoreError> {
        let rel = Self::path(session_id);
        let cache = if jail.exists(Root::Wizards, &rel) {
            let file = jail
                .open_read(Root::Wizards, &rel)
                .map_err(|e| e.into_core_error(false))?;
            serde_json::from_reader(file).map_err(|e| CoreError::internal(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            jail,
            session_id: session_id.to_string(),
            cache: Mutex::new(cache),
        })
    }

    pub fn get(&self, idempotency_key: &str) -> Option<String> {
        self.cache.lock().expect("idempotency lock poisoned").get(idempotency_key).cloned()
    }

    pub fn insert(&self, idempotency_key: &str, job_id: &str) -> Result<(), CoreError> {
        let mut map = self.cache.lock().expect("idempotency lock poisoned");
        map.insert(idempotency_key.to_string(), job_id.to_string());
        let v = serde_json::to_value(&*map).map_err(|e| CoreError::internal(e.to_string()))?;
        let bytes = iw_canon::canonical_json_bytes(&v)?;
        self.jail
            .write_atomic(Root::Wizards, &Self::path(&self.session_id), &bytes)
            .map_err(|e| e.into_core_error(false))
    }
}

/// Ties together the store, the idempotency map, and diagnostics emission
/// for every lifecycle transition.
pub struct JobService {
    store: JobStore,
    bus: Option<Arc<EventBus>>,
}

impl JobService {
    pub fn new(jail: Jail, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            store: JobStore::new(jail),
            bus,
        }
    }

    pub fn create(&self, job_type: JobType, meta: JobMeta) -> Result<JobRecord, CoreError> {
        let job = JobRecord::new(job_type, meta);
        self.store.save(&job)?;
        self.emit("job.create", &job);
        Ok(job)
    }

    pub fn transition(&self, job_id: &JobId, to: JobState) -> Result<JobRecord, CoreError> {
        let mut job = self.store.load(job_id)?;
        job.transition(to)?;
        self.store.save(&job)?;
        if matches!(to, JobState::Succeeded | JobState::Failed | JobState::Cancelled) {
            self.emit("diag.job.end", &job);
        } else if to == JobState::Running {
            self.emit("diag.job.start", &job);
        }
        Ok(job)
    }

    pub fn load(&self, job_id: &JobId) -> Result<JobRecord, CoreError> {
        self.store.load(job_id)
    }

    pub fn list(&self) -> Result<Vec<JobRecord>, CoreError> {
        self.store.list()
    }

    pub fn append_log(&self, job_id: &JobId, line: &str) -> Result<(), CoreError> {
        self.store.append_log(job_id, line)
    }

    /// Full contents of `<job_id>.log`, used by the registry-marking
    /// diagnostics subscriber to recover the identity keys a runner
    /// processed without re-touching (possibly now-deleted) source files.
    pub fn read_log(&self, job_id: &JobId) -> Result<String, CoreError> {
        let mut file = self
            .store
            .jail
            .open_read(Root::Jobs, &job_log_path(job_id))
            .map_err(|e| e.into_core_error(true))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(|e| CoreError::internal(e.to_string()))?;
        Ok(buf)
    }

    /// Progress-only update; does not change `state`. Used by the runner to
    /// report fractional completion across a multi-book batch.
    pub fn update_progress(&self, job_id: &JobId, progress: f64) -> Result<(), CoreError> {
        let mut job = self.store.load(job_id)?;
        job.progress = progress.clamp(0.0, 1.0);
        self.store.save(&job)
    }

    /// Open Question #2 (§9): non-mp3 audio files are skipped with a
    /// diagnostic but not otherwise reported; this surfaces them on the job
    /// record instead of dropping them.
    pub fn add_warning(&self, job_id: &JobId, warning: impl Into<String>) -> Result<(), CoreError> {
        let mut job = self.store.load(job_id)?;
        let warning = warning.into();
        if !job.meta.warnings.contains(&warning) {
            job.meta.warnings.push(warning);
        }
        self.store.save(&job)
    }

    /// `RUNNING -> SUCCEEDED`, setting `progress = 1.0` first (§4.I "On
    /// success: set progress=1, transition to SUCCEEDED").
    pub fn mark_succeeded(&self, job_id: &JobId) -> Result<JobRecord, CoreError> {
        let mut job = self.store.load(job_id)?;
        job.progress = 1.0;
        job.transition(JobState::Succeeded)?;
        self.store.save(&job)?;
        self.emit("diag.job.end", &job);
        Ok(job)
    }

    /// `RUNNING -> FAILED`, recording `error` first (§7 "mark the Job
    /// FAILED with `error` set").
    pub fn mark_failed(&self, job_id: &JobId, error: impl Into<String>) -> Result<JobRecord, CoreError> {
        let mut job = self.store.load(job_id)?;
        job.error = Some(error.into());
        job.transition(JobState::Failed)?;
        self.store.save(&job)?;
        self.emit("diag.job.end", &job);
        Ok(job)
    }

    fn emit(&self, event: &str, job: &JobRecord) {
        if let Some(bus) = &self.bus {
            bus.publish(
                event,
                "jobs",
                "transition",
                serde_json::json!({
                    "job_id": job.job_id.as_str(),
                    "status": job_status_str(job.state),
                    "job_type": job_type_str(job.job_type),
                    "meta": job.meta,
                }),
            );
        }
    }
}

fn job_status_str(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "pending",
        JobState::Running => "running",
        JobState::Succeeded => "succeeded",
        JobState::Failed => "failed",
        JobState::Cancelled => "cancelled",
    }
}

fn job_type_str(t: JobType) -> &'static str {
    match t {
        JobType::Process => "process",
        JobType::Import => "import",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iw_fs::RootPaths;
    use tempfile::TempDir;

    fn jail() -> (TempDir, Jail) {
        let tmp = TempDir::new().unwrap();
        let jobs = tmp.path().join("jobs");
        std::fs::create_dir_all(&jobs).unwrap();
        let roots = RootPaths::new(
            tmp.path().join("inbox"),
            tmp.path().join("stage"),
            jobs,
            tmp.path().join("outbox"),
            tmp.path().join("config"),
            tmp.path().join("wizards"),
        );
        (tmp, Jail::new(roots, None))
    }

    #[test]
    fn legal_and_illegal_transitions() {
        let mut job = JobRecord::new(JobType::Import, JobMeta::default());
        assert_eq!(job.state, JobState::Pending);
        job.transition(JobState::Running).unwrap();
        assert_eq!(job.state, JobState::Running);
        job.transition(JobState::Succeeded).unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.transition(JobState::Running).is_err());
    }

    #[test]
    fn cancel_from_pending_is_legal() {
        let mut job = JobRecord::new(JobType::Import, JobMeta::default());
        job.transition(JobState::Cancelled).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[test]
    fn store_round_trips() {
        let (_tmp, jail) = jail();
        let store = JobStore::new(jail);
        let job = JobRecord::new(JobType::Process, JobMeta::default());
        store.save(&job).unwrap();
        let loaded = store.load(&job.job_id).unwrap();
        assert_eq!(loaded.job_id, job.job_id);
    }

    #[test]
    fn idempotency_map_persists() {
        let (_tmp, jail) = jail();
        let map = IdempotencyMap::load(jail.clone(), "sess1").unwrap();
        map.insert("key123", "job456").unwrap();
        let reloaded = IdempotencyMap::load(jail, "sess1").unwrap();
        assert_eq!(reloaded.get("key123"), Some("job456".to_string()));
    }
}
