//! Bounded worker pool and pause/resume queue state (component E, §4.E,
//! §5). Cancellation is cooperative, modeled on
//! `casparian_worker::cancel::CancellationToken`.

use crate::job::{JobMeta, JobRecord, JobService, JobState, JobType};
use iw_canon::error::CoreError;
use iw_fs::{Jail, RelativePath, Root};
use iw_ids::JobId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cooperative cancellation token for a single job. Workers observe it at
/// every externally observable boundary (copy-begin, audio-begin,
/// delete-source-begin); it never forcibly interrupts a thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    pub mode: QueueMode,
}

const QUEUE_STATE_PATH: &str = "import_wizard/queue_state.json";

/// Per-patches-root queue admission state, persisted once and mutated only
/// through this service (§3 "QueueState ... mutated only through the queue
/// service").
pub struct Queue {
    jail: Jail,
    job_service: Arc<JobService>,
    state: Mutex<QueueState>,
    tokens: Mutex<std::collections::HashMap<String, CancellationToken>>,
    parallelism: usize,
}

impl Queue {
    fn state_path() -> RelativePath {
        RelativePath::parse(QUEUE_STATE_PATH).expect("queue state path is a safe literal")
    }

    /// `parallelism` is `session.parallelism_n` clamped to `[1, ∞)`;
    /// default 1 for inplace mode, default 2 for stage mode (§4.E).
    pub fn new(jail: Jail, job_service: Arc<JobService>, parallelism: usize) -> Result<Self, CoreError> {
        let rel = Self::state_path();
        let state = if jail.exists(Root::Jobs, &rel) {
            let file = jail.open_read(Root::Jobs, &rel).map_err(|e| e.into_core_error(false))?;
            serde_json::from_reader(file).map_err(|e| CoreError::internal(e.to_string()))?
        } else {
            QueueState {
                mode: QueueMode::Running,
            }
        };
        let queue = Self {
            jail,
            job_service,
            state: Mutex::new(state),
            tokens: Mutex::new(std::collections::HashMap::new()),
            parallelism: parallelism.max(1),
        };
        queue.persist()?;
        Ok(queue)
    }

    pub fn default_parallelism(mode: &str) -> usize {
        if mode == "inplace" {
            1
        } else {
            2
        }
    }

    fn persist(&self) -> Result<(), CoreError> {
        let state = self.state.lock().expect("queue state lock poisoned");
        let v = serde_json::to_value(&*state).map_err(|e| CoreError::internal(e.to_string()))?;
        let bytes = iw_canon::canonical_json_bytes(&v)?;
        self.jail
            .write_atomic(Root::Jobs, &Self::state_path(), &bytes)
            .map_err(|e| e.into_core_error(false))
    }

    pub fn pause(&self) -> Result<(), CoreError> {
        self.state.lock().expect("queue state lock poisoned").mode = QueueMode::Paused;
        self.persist()
    }

    pub fn resume(&self) -> Result<(), CoreError> {
        self.state.lock().expect("queue state lock poisoned").mode = QueueMode::Running;
        self.persist()
    }

    pub fn mode(&self) -> QueueMode {
        self.state.lock().expect("queue state lock poisoned").mode
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Register the cancellation token a worker should observe for `job_id`.
    pub fn token_for(&self, job_id: &JobId) -> CancellationToken {
        let mut tokens = self.tokens.lock().expect("tokens lock poisoned");
        tokens
            .entry(job_id.as_str().to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Cancel a PENDING or RUNNING job (§3 "Cancellation is only valid from
    /// PENDING or RUNNING"). Other states yield `ILLEGAL_TRANSITION`.
    pub fn cancel(&self, job_id: &JobId) -> Result<JobRecord, CoreError> {
        let job = self.job_service.load(job_id)?;
        if !matches!(job.state, JobState::Pending | JobState::Running) {
            return Err(CoreError::invariant_reason(
                "illegal_transition",
                format!("cannot cancel job in state {:?}", job.state),
            ));
        }
        self.token_for(job_id).cancel();
        self.job_service.transition(job_id, JobState::Cancelled)
    }

    /// Create a new PENDING job carrying the same decision, with
    /// `meta.retry_of` pointing at the prior job (§4.E, §7 "retry policy").
    /// The prior job's state is untouched.
    pub fn retry(&self, prior: &JobRecord) -> Result<JobRecord, CoreError> {
        let mut meta = prior.meta.clone();
        meta.retry_of = Some(prior.job_id.as_str().to_string());
        self.job_service.create(prior.job_type, meta)
    }

    /// Whether the pool should currently admit PENDING jobs; callers poll
    /// this between sleep intervals while paused (§5 "paused workers wake
    /// periodically and either admit or continue sleeping").
    pub fn is_admitting(&self) -> bool {
        self.mode() == QueueMode::Running
    }

    /// Jobs of kind `import` in PENDING state, oldest first, bounded to
    /// `parallelism` slots' worth of work for a single pull.
    pub fn pending_import_jobs(&self) -> Result<Vec<JobRecord>, CoreError> {
        let mut jobs: Vec<JobRecord> = self
            .job_service
            .list()?
            .into_iter()
            .filter(|j| j.job_type == JobType::Import && j.state == JobState::Pending)
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobService;
    use iw_fs::RootPaths;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<JobService>, Jail) {
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
        let jail = Jail::new(roots, None);
        let job_service = Arc::new(JobService::new(jail.clone(), None));
        (tmp, job_service, jail)
    }

    #[test]
    fn pause_resume_persists() {
        let (_tmp, job_service, jail) = setup();
        let queue = Queue::new(jail, job_service, 1).unwrap();
        assert_eq!(queue.mode(), QueueMode::Running);
        queue.pause().unwrap();
        assert_eq!(queue.mode(), QueueMode::Paused);
        assert!(!queue.is_admitting());
    }

    #[test]
    fn cancel_pending_job_succeeds_running_rejects_terminal() {
        let (_tmp, job_service, jail) = setup();
        let queue = Queue::new(jail, Arc::clone(&job_service), 1).unwrap();
        let job = job_service.create(JobType::Import, JobMeta::default()).unwrap();
        let cancelled = queue.cancel(&job.job_id).unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert!(queue.cancel(&job.job_id).is_err());
    }

    #[test]
    fn retry_creates_new_job_with_back_pointer() {
        let (_tmp, job_service, jail) = setup();
        let queue = Queue::new(jail, Arc::clone(&job_service), 1).unwrap();
        let job = job_service.create(JobType::Import, JobMeta::default()).unwrap();
        let retried = queue.retry(&job).unwrap();
        assert_eq!(retried.meta.retry_of.as_deref(), Some(job.job_id.as_str()));
        assert_eq!(retried.state, JobState::Pending);
    }

    #[test]
    fn default_parallelism_matches_mode() {
        assert_eq!(Queue::default_parallelism("inplace"), 1);
        assert_eq!(Queue::default_parallelism("stage"), 2);
    }
}
