//! The wizard engine (component H, §4.H): session lifecycle, step
//! submission, non-linear navigation, plan computation, and the gate into
//! phase-2 job-request construction.

pub mod discovery_snapshot;
pub mod engine;
pub mod ids;
pub mod model;
pub mod plan;
pub mod selection;
pub mod state;

pub use engine::{PreviewHandle, StartProcessingResult, WizardEngine};
pub use plan::{BookDecision, DecisionUnitType, Plan};
pub use state::{Conflicts, ConflictItem, Derived, Mode, SessionState, SessionStatus, SourceRef};
