//! Job-request builder and runner (component I, §4.I): turns an accepted
//! wizard plan into the canonical `job_requests.json` document, and
//! executes that document's per-book actions against the jailed
//! filesystem once a queue worker picks up the owning job.

pub mod builder;
pub mod runner;

pub use builder::{
    ActionSource, ActionTarget, AudioProcessingOptions, BookAction, BookPlanEntry, DeleteSourceOptions,
    DiagnosticsContext, JobRequestDoc, JobRequestOptions, PlanSummaryEntry,
};
pub use runner::{run_import_job, RunnerConfig};
