//! `SessionState` (§3) and the small value types nested inside it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Stage,
    Inplace,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Stage => "stage",
            Mode::Inplace => "inplace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stage" => Some(Mode::Stage),
            "inplace" => Some(Mode::Inplace),
            _ => None,
        }
    }

    /// Default parallelism per mode (§4.E): 1 for inplace, 2 for stage.
    pub fn default_parallelism(self) -> usize {
        match self {
            Mode::Inplace => 1,
            Mode::Stage => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Aborted,
    Processing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub root: String,
    pub rel_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Derived {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_config_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConflictItem {
    pub root: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conflicts {
    pub present: bool,
    pub items: Vec<ConflictItem>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

/// `SessionState` (§3). Persisted at `wizards:import/sessions/<sid>/state.json`,
/// one atomic write per transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub phase: u8,
    pub mode: Mode,
    pub source: SourceRef,
    pub current_step_id: String,
    pub completed_step_ids: Vec<String>,
    pub answers: BTreeMap<String, serde_json::Value>,
    /// Legacy mirror of `answers`, kept in lock-step (§3).
    pub inputs: BTreeMap<String, serde_json::Value>,
    pub computed: serde_json::Map<String, serde_json::Value>,
    pub selected_author_ids: Vec<String>,
    pub selected_book_ids: Vec<String>,
    pub effective_author_title: BTreeMap<String, serde_json::Value>,
    pub derived: Derived,
    pub conflicts: Conflicts,
    pub status: SessionStatus,
    pub model_fingerprint: String,
    pub errors: Vec<String>,
    /// Open question #1 (§9): a monotonic per-session sequence alongside
    /// the conflict fingerprint, to disambiguate scans taken at the same
    /// fingerprint but different points in time.
    #[serde(default)]
    pub sequence: u64,
}

impl SessionState {
    pub fn answer(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.answers.get(step_id)
    }

    pub fn record_answer(&mut self, step_id: &str, payload: serde_json::Value) {
        self.answers.insert(step_id.to_string(), payload.clone());
        self.inputs.insert(step_id.to_string(), payload);
        if !self.completed_step_ids.contains(&step_id.to_string()) {
            self.completed_step_ids.push(step_id.to_string());
        }
    }

    pub fn conflict_policy_mode(&self) -> &str {
        self.answer("conflict_policy")
            .and_then(|v| v.get("mode"))
            .and_then(|v| v.as_str())
            .unwrap_or("overwrite")
    }

    pub fn is_phase_two(&self) -> bool {
        self.phase == 2
    }
}
