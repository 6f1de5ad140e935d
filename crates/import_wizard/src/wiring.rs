//! Process-wide wiring: jail, event bus, job service, queue, processed
//! registry, wizard engine, and the patches-root lock, all built once per
//! invocation (§10.1, §3 "process-wide singletons keyed by Wizards-root
//! path").

use crate::config::RootConfig;
use iw_diagnostics::EventBus;
use iw_fs::{Jail, RootPaths};
use iw_jobs::lock::{try_lock_patches_root, LockError, PatchesRootLock};
use iw_jobs::{JobService, ProcessedRegistry, Queue};
use iw_wizard::engine::WizardEngine;
use std::sync::Arc;

pub struct Process {
    pub jail: Jail,
    pub bus: Arc<EventBus>,
    pub job_service: Arc<JobService>,
    pub queue: Queue,
    pub registry: Arc<ProcessedRegistry>,
    pub engine: WizardEngine,
    _lock: PatchesRootLock,
}

impl Process {
    /// Build every component and acquire the patches-root lock. Held for
    /// the remainder of the process's lifetime (§9 "Global state"); never
    /// re-acquired by child operations.
    pub fn build(roots: &RootConfig, parallelism: usize) -> Result<Self, LockError> {
        let lock = try_lock_patches_root(&roots.patches_root())?;

        let bus = EventBus::new();
        let root_paths = RootPaths::new(
            roots.inbox.clone(),
            roots.stage.clone(),
            roots.jobs.clone(),
            roots.outbox.clone(),
            roots.config.clone(),
            roots.wizards.clone(),
        );
        let jail = Jail::new(root_paths, Some(Arc::clone(&bus)));
        let job_service = Arc::new(JobService::new(jail.clone(), Some(Arc::clone(&bus))));
        let registry = Arc::new(
            ProcessedRegistry::load(jail.clone()).map_err(|e| {
                tracing::error!(error = %e, "failed to load processed registry");
                LockError::AcquireFailed(std::io::Error::new(std::io::ErrorKind::Other, e.message().to_string()))
            })?,
        );
        register_registry_subscriber(&bus, Arc::clone(&job_service), Arc::clone(&registry));

        let queue = Queue::new(jail.clone(), Arc::clone(&job_service), parallelism).map_err(|e| {
            LockError::AcquireFailed(std::io::Error::new(std::io::ErrorKind::Other, e.message().to_string()))
        })?;
        let engine = WizardEngine::new(jail.clone(), Some(Arc::clone(&bus)), Arc::clone(&job_service));

        Ok(Self {
            jail,
            bus,
            job_service,
            queue,
            registry,
            engine,
            _lock: lock,
        })
    }
}

/// The sole writer to the processed registry (§3 invariant 4, §4.I). Reacts
/// to `diag.job.end` with `status=="succeeded"` by reading the job's log
/// back for `processed_key: <key>` lines the runner wrote on its success
/// path, and admitting each one. Ordering is safe because `mark_succeeded`
/// persists the job record before it emits this event.
fn register_registry_subscriber(bus: &Arc<EventBus>, job_service: Arc<JobService>, registry: Arc<ProcessedRegistry>) {
    bus.subscribe("diag.job.end", move |envelope| {
        let Some(status) = envelope.data.get("status").and_then(|v| v.as_str()) else {
            return;
        };
        if status != "succeeded" {
            return;
        }
        let Some(job_id_str) = envelope.data.get("job_id").and_then(|v| v.as_str()) else {
            return;
        };
        let Ok(job_id) = iw_ids::JobId::parse(job_id_str) else {
            return;
        };
        let Ok(log) = job_service.read_log(&job_id) else {
            return;
        };
        for line in log.lines() {
            if let Some(key) = line.strip_prefix("processed_key: ") {
                if let Err(e) = registry.mark(key) {
                    tracing::warn!(job_id = %job_id_str, key = %key, error = %e, "failed to mark processed registry");
                }
            }
        }
    });
}
