//! Bounded worker pool draining PENDING import jobs (component E, §4.E,
//! §5). Each CLI invocation is request/response, not a long-running
//! daemon, so the process that created new PENDING jobs also drains them
//! before it exits, bounded by the queue's configured parallelism.

use crate::wiring::Process;
use iw_jobreq::{run_import_job, RunnerConfig};
use iw_jobs::job::JobState;
use std::thread;

/// Run every currently-PENDING import job to completion, `parallelism`
/// jobs at a time. Returns the job ids that were drained this call.
pub fn drain_pending_import_jobs(process: &Process) -> Vec<String> {
    let pending = match process.queue.pending_import_jobs() {
        Ok(jobs) => jobs,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list pending import jobs");
            return Vec::new();
        }
    };
    if pending.is_empty() || !process.queue.is_admitting() {
        return Vec::new();
    }

    let config = RunnerConfig::default();
    let mut drained = Vec::new();
    for chunk in pending.chunks(process.queue.parallelism().max(1)) {
        thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|job| {
                    let job_id = job.job_id.clone();
                    let config = &config;
                    scope.spawn(move || run_one(process, job_id, config))
                })
                .collect();
            for handle in handles {
                if let Err(e) = handle.join() {
                    tracing::error!(panic = ?e, "import job worker thread panicked");
                }
            }
        });
        drained.extend(chunk.iter().map(|j| j.job_id.as_str().to_string()));
    }
    drained
}

fn run_one(process: &Process, job_id: iw_ids::JobId, config: &RunnerConfig) {
    let token = process.queue.token_for(&job_id);

    let record = match process.job_service.transition(&job_id, JobState::Running) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "cannot start job, skipping");
            return;
        }
    };

    let doc = match record
        .meta
        .decision_json
        .as_ref()
        .and_then(|v| serde_json::from_value::<iw_jobreq::JobRequestDoc>(v.clone()).ok())
    {
        Some(doc) => doc,
        None => {
            let _ = process.job_service.mark_failed(&job_id, "job record missing job_requests document");
            return;
        }
    };

    let result = run_import_job(&process.jail, &process.job_service, &process.registry, &job_id, &doc, config, &token);

    // A job whose owning runner observed cancellation returns Ok(()) having
    // already left the job in whatever terminal state the caller set; only
    // mark SUCCEEDED/FAILED here if it is still RUNNING.
    let current = match process.job_service.load(&job_id) {
        Ok(j) => j,
        Err(_) => return,
    };
    if current.state != JobState::Running {
        return;
    }
    match result {
        Ok(()) => {
            if let Err(e) = process.job_service.mark_succeeded(&job_id) {
                tracing::error!(job_id = %job_id, error = %e, "failed to mark job succeeded");
            }
        }
        Err(e) => {
            if let Err(e2) = process.job_service.mark_failed(&job_id, e.message().to_string()) {
                tracing::error!(job_id = %job_id, error = %e2, "failed to mark job failed");
            }
        }
    }
}
