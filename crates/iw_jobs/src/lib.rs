//! Job store, job service, queue, lock, and processed registry (components
//! D, E, F — §4.D, §4.E, §4.F).

pub mod job;
pub mod lock;
pub mod queue;
pub mod registry;

pub use job::{IdempotencyMap, JobMeta, JobRecord, JobService, JobState, JobStore, JobType};
pub use lock::{try_lock_patches_root, LockError, PatchesRootLock};
pub use queue::{CancellationToken, Queue, QueueMode, QueueState};
pub use registry::{identity_key, ProcessedRegistry};
