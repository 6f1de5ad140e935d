//! Builds the `job_requests.json` document (§4.I, §6.1) from a computed
//! plan and the session's policy answers. The document is single-write and
//! terminal: once persisted, phase-2 resume reads it back verbatim rather
//! than rebuilding it (`iw_wizard::engine::start_processing`).

use iw_canon::error::CoreError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSource {
    pub root: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTarget {
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummaryEntry {
    pub book_id: String,
    pub title: String,
    pub author: String,
    pub unit_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAction {
    #[serde(rename = "type")]
    pub action_type: String,
    pub source: ActionSource,
    pub target: ActionTarget,
    pub plan_summary: PlanSummaryEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsContext {
    pub model_fp: String,
    pub discovery_fp: String,
    pub effective_config_fp: String,
    pub conflict_fp: String,
}

/// `audio_processing` policy answer, carried into the job document so the
/// runner does not need to re-read session state to act (§4.I).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioProcessingOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default = "default_bitrate_mode")]
    pub bitrate_mode: String,
}

fn default_bitrate_mode() -> String {
    "vbr".to_string()
}

/// `delete_source_policy` policy answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteSourceOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub guard_enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequestOptions {
    pub audio_processing: AudioProcessingOptions,
    pub delete_source: DeleteSourceOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequestDoc {
    pub job_type: String,
    pub job_version: u32,
    pub session_id: String,
    pub mode: String,
    pub config_fingerprint: String,
    pub actions: Vec<BookAction>,
    pub diagnostics_context: DiagnosticsContext,
    pub options: JobRequestOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// One selected book as handed to the builder by the plan (`iw_wizard::plan::BookDecision`
/// stripped down to the primitives the builder needs, so this crate never
/// depends on `iw_wizard`'s own types).
pub struct BookPlanEntry {
    pub book_id: String,
    pub book_rel_path: String,
    pub title: String,
    pub author: String,
    pub unit_type: String,
}

#[allow(clippy::too_many_arguments)]
pub fn build(
    session_id: &str,
    mode: &str,
    source_root: &str,
    config_fingerprint: &str,
    model_fp: &str,
    discovery_fp: &str,
    conflict_fp: &str,
    books: &[BookPlanEntry],
    audio_processing: AudioProcessingOptions,
    delete_source: DeleteSourceOptions,
) -> Result<JobRequestDoc, CoreError> {
    // §4.I literal shape: `target: {root: stage|outbox}`. Stage mode copies
    // into a fresh per-job staging directory; every other mode publishes
    // straight to the outbox (inplace leaves target_root/target_rel
    // pointing at the source, resolved by the runner, not the builder).
    let target_root = if mode == "stage" { "stage" } else { "outbox" };

    let actions = books
        .iter()
        .map(|b| BookAction {
            action_type: "import.batch".to_string(),
            source: ActionSource {
                root: source_root.to_string(),
                relative_path: b.book_rel_path.clone(),
            },
            target: ActionTarget {
                root: target_root.to_string(),
            },
            plan_summary: PlanSummaryEntry {
                book_id: b.book_id.clone(),
                title: b.title.clone(),
                author: b.author.clone(),
                unit_type: b.unit_type.clone(),
            },
        })
        .collect();

    let mut doc = JobRequestDoc {
        job_type: "import.process".to_string(),
        job_version: 1,
        session_id: session_id.to_string(),
        mode: mode.to_string(),
        config_fingerprint: config_fingerprint.to_string(),
        actions,
        diagnostics_context: DiagnosticsContext {
            model_fp: model_fp.to_string(),
            discovery_fp: discovery_fp.to_string(),
            effective_config_fp: config_fingerprint.to_string(),
            conflict_fp: conflict_fp.to_string(),
        },
        options: JobRequestOptions {
            audio_processing,
            delete_source,
        },
        idempotency_key: None,
    };

    let key = iw_canon::fingerprint(&doc)?;
    doc.idempotency_key = Some(key);
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_book() -> BookPlanEntry {
        BookPlanEntry {
            book_id: "b1".to_string(),
            book_rel_path: "Author/Book".to_string(),
            title: "Book".to_string(),
            author: "Author".to_string(),
            unit_type: "dir".to_string(),
        }
    }

    #[test]
    fn stage_mode_targets_stage_root() {
        let doc = build(
            "sess1",
            "stage",
            "inbox",
            "cfg-fp",
            "model-fp",
            "disc-fp",
            "conflict-fp",
            &[one_book()],
            AudioProcessingOptions::default(),
            DeleteSourceOptions::default(),
        )
        .unwrap();
        assert_eq!(doc.actions[0].target.root, "stage");
    }

    #[test]
    fn inplace_mode_targets_outbox_root() {
        let doc = build(
            "sess1",
            "inplace",
            "inbox",
            "cfg-fp",
            "model-fp",
            "disc-fp",
            "conflict-fp",
            &[one_book()],
            AudioProcessingOptions::default(),
            DeleteSourceOptions::default(),
        )
        .unwrap();
        assert_eq!(doc.actions[0].target.root, "outbox");
    }

    #[test]
    fn idempotency_key_is_stable_for_identical_input() {
        let books = [one_book()];
        let a = build(
            "sess1", "stage", "inbox", "cfg-fp", "model-fp", "disc-fp", "conflict-fp", &books,
            AudioProcessingOptions::default(), DeleteSourceOptions::default(),
        )
        .unwrap();
        let b = build(
            "sess1", "stage", "inbox", "cfg-fp", "model-fp", "disc-fp", "conflict-fp", &books,
            AudioProcessingOptions::default(), DeleteSourceOptions::default(),
        )
        .unwrap();
        assert_eq!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn idempotency_key_changes_with_book_set() {
        let a = build(
            "sess1", "stage", "inbox", "cfg-fp", "model-fp", "disc-fp", "conflict-fp", &[one_book()],
            AudioProcessingOptions::default(), DeleteSourceOptions::default(),
        )
        .unwrap();
        let mut other = one_book();
        other.book_id = "b2".to_string();
        let b = build(
            "sess1", "stage", "inbox", "cfg-fp", "model-fp", "disc-fp", "conflict-fp", &[other],
            AudioProcessingOptions::default(), DeleteSourceOptions::default(),
        )
        .unwrap();
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }
}
