//! End-to-end import scenarios, driven the way a single CLI invocation
//! drives them: wizard engine calls followed by draining whatever PENDING
//! import jobs phase 2 produced. The wiring here mirrors
//! `crate::wiring::Process::build` minus the patches-root lock, which is
//! a cross-process concern this test has no second process to race with.

use iw_diagnostics::EventBus;
use iw_fs::{Jail, RootPaths};
use iw_jobreq::{run_import_job, RunnerConfig};
use iw_jobs::job::JobState;
use iw_jobs::{IdempotencyMap, JobService, ProcessedRegistry, Queue};
use iw_wizard::engine::WizardEngine;
use iw_wizard::state::Mode;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    tmp: TempDir,
    jail: Jail,
    job_service: Arc<JobService>,
    queue: Queue,
    registry: Arc<ProcessedRegistry>,
    engine: WizardEngine,
}

fn build_harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("inbox")).unwrap();
    fs::create_dir_all(tmp.path().join("jobs")).unwrap();

    let bus = EventBus::new();
    let roots = RootPaths::new(
        tmp.path().join("inbox"),
        tmp.path().join("stage"),
        tmp.path().join("jobs"),
        tmp.path().join("outbox"),
        tmp.path().join("config"),
        tmp.path().join("wizards"),
    );
    let jail = Jail::new(roots, Some(Arc::clone(&bus)));
    let job_service = Arc::new(JobService::new(jail.clone(), Some(Arc::clone(&bus))));
    let registry = Arc::new(ProcessedRegistry::load(jail.clone()).unwrap());
    register_registry_subscriber(&bus, Arc::clone(&job_service), Arc::clone(&registry));
    let queue = Queue::new(jail.clone(), Arc::clone(&job_service), 2).unwrap();
    let engine = WizardEngine::new(jail.clone(), Some(Arc::clone(&bus)), Arc::clone(&job_service));

    Harness {
        tmp,
        jail,
        job_service,
        queue,
        registry,
        engine,
    }
}

fn register_registry_subscriber(bus: &Arc<EventBus>, job_service: Arc<JobService>, registry: Arc<ProcessedRegistry>) {
    bus.subscribe("diag.job.end", move |envelope| {
        let Some(status) = envelope.data.get("status").and_then(|v| v.as_str()) else { return };
        if status != "succeeded" {
            return;
        }
        let Some(job_id_str) = envelope.data.get("job_id").and_then(|v| v.as_str()) else { return };
        let Ok(job_id) = iw_ids::JobId::parse(job_id_str) else { return };
        let Ok(log) = job_service.read_log(&job_id) else { return };
        for line in log.lines() {
            if let Some(key) = line.strip_prefix("processed_key: ") {
                let _ = registry.mark(key);
            }
        }
    });
}

/// Drains every PENDING import job sequentially (a single-threaded stand-in
/// for `worker::drain_pending_import_jobs`, sufficient for these fixtures).
fn drain(h: &Harness) -> Vec<String> {
    let pending = h.queue.pending_import_jobs().unwrap();
    let config = RunnerConfig::default();
    let mut drained = Vec::new();
    for record in pending {
        let job_id = record.job_id.clone();
        let token = h.queue.token_for(&job_id);
        let record = h.job_service.transition(&job_id, JobState::Running).unwrap();
        let doc: iw_jobreq::JobRequestDoc =
            serde_json::from_value(record.meta.decision_json.clone().unwrap()).unwrap();
        let result = run_import_job(&h.jail, &h.job_service, &h.registry, &job_id, &doc, &config, &token);
        match result {
            Ok(()) => {
                h.job_service.mark_succeeded(&job_id).unwrap();
            }
            Err(e) => {
                h.job_service.mark_failed(&job_id, e.message().to_string()).unwrap();
            }
        }
        drained.push(job_id.as_str().to_string());
    }
    drained
}

fn first_item_id(engine: &WizardEngine, sid: &str, step_id: &str) -> String {
    let fields = engine.get_step_definition(sid, step_id).unwrap();
    fields[0].items.as_ref().unwrap()[0].item_id.clone()
}

/// Submits every flow step up to and including `final_summary_confirm`,
/// driving the session to "processing" under the given conflict policy.
/// Assumes no unresolved conflicts (policy "overwrite" or no collision).
fn run_flow_to_processing(engine: &WizardEngine, sid: &str, conflict_mode: &str) {
    let author_id = first_item_id(engine, sid, "select_authors");
    engine.submit_step(sid, "select_authors", serde_json::json!({"selection_ids": [author_id]})).unwrap();
    let book_id = first_item_id(engine, sid, "select_books");
    engine.submit_step(sid, "select_books", serde_json::json!({"selection_ids": [book_id]})).unwrap();
    engine.submit_step(sid, "plan_preview_batch", serde_json::json!({})).unwrap();
    engine.submit_step(sid, "effective_author_title", serde_json::json!({})).unwrap();
    engine.submit_step(sid, "filename_policy", serde_json::json!({})).unwrap();
    engine.submit_step(sid, "covers_policy", serde_json::json!({})).unwrap();
    engine.submit_step(sid, "id3_policy", serde_json::json!({})).unwrap();
    engine.submit_step(sid, "audio_processing", serde_json::json!({})).unwrap();
    engine.submit_step(sid, "publish_policy", serde_json::json!({})).unwrap();
    engine.submit_step(sid, "delete_source_policy", serde_json::json!({})).unwrap();
    engine.submit_step(sid, "conflict_policy", serde_json::json!({"mode": conflict_mode})).unwrap();
    engine.submit_step(sid, "parallelism", serde_json::json!({})).unwrap();
    let state = engine.submit_step(sid, "final_summary_confirm", serde_json::json!({"confirm_start": true})).unwrap();
    assert_eq!(state.current_step_id, "processing");
}

// A single author/book directory, no conflicts, staged import.
#[test]
fn clean_import_to_stage_succeeds() {
    let h = build_harness();
    fs::create_dir_all(h.tmp.path().join("inbox").join("Author/Book")).unwrap();
    fs::write(h.tmp.path().join("inbox").join("Author/Book/track01.mp3"), b"audio").unwrap();

    let state = h.engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
    let sid = state.session_id.clone();
    run_flow_to_processing(&h.engine, &sid, "overwrite");

    let idempotency = IdempotencyMap::load(h.jail.clone(), &sid).unwrap();
    let result = h.engine.start_processing(&sid, true, &idempotency).unwrap();
    assert_eq!(result.job_ids.len(), 1);

    let drained = drain(&h);
    assert_eq!(drained, result.job_ids);

    let job = h.job_service.load(&iw_ids::JobId::parse(&result.job_ids[0]).unwrap()).unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert!(h.registry.stats() >= 1);
}

// A pre-existing Outbox collision under the "ask" policy must route
// through resolve_conflicts_batch before processing can start.
#[test]
fn conflict_requires_explicit_resolution_before_processing() {
    let h = build_harness();
    fs::create_dir_all(h.tmp.path().join("inbox").join("Author/Book")).unwrap();
    fs::write(h.tmp.path().join("inbox").join("Author/Book/track01.mp3"), b"audio").unwrap();
    fs::create_dir_all(h.tmp.path().join("outbox").join("Author/Book")).unwrap();
    fs::write(h.tmp.path().join("outbox").join("Author/Book/track01.mp3"), b"existing").unwrap();

    let state = h.engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
    let sid = state.session_id.clone();

    let author_id = first_item_id(&h.engine, &sid, "select_authors");
    h.engine.submit_step(&sid, "select_authors", serde_json::json!({"selection_ids": [author_id]})).unwrap();
    let book_id = first_item_id(&h.engine, &sid, "select_books");
    h.engine.submit_step(&sid, "select_books", serde_json::json!({"selection_ids": [book_id]})).unwrap();
    h.engine.submit_step(&sid, "plan_preview_batch", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "effective_author_title", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "filename_policy", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "covers_policy", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "id3_policy", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "audio_processing", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "publish_policy", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "delete_source_policy", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "conflict_policy", serde_json::json!({"mode": "ask"})).unwrap();
    h.engine.submit_step(&sid, "parallelism", serde_json::json!({})).unwrap();

    let state = h.engine.submit_step(&sid, "final_summary_confirm", serde_json::json!({"confirm_start": true})).unwrap();
    assert_eq!(state.current_step_id, "resolve_conflicts_batch");

    let idempotency = IdempotencyMap::load(h.jail.clone(), &sid).unwrap();
    let err = h.engine.start_processing(&sid, true, &idempotency).unwrap_err();
    assert_eq!(err.code(), "CONFLICTS_UNRESOLVED");

    h.engine.submit_step(&sid, "resolve_conflicts_batch", serde_json::json!({"confirm": true})).unwrap();
    let state = h.engine.submit_step(&sid, "final_summary_confirm", serde_json::json!({"confirm_start": true})).unwrap();
    assert_eq!(state.current_step_id, "processing");

    let result = h.engine.start_processing(&sid, true, &idempotency).unwrap();
    assert_eq!(result.job_ids.len(), 1);
    drain(&h);
}

// Calling start_processing twice (simulating the CLI invoked twice
// against the same session) must not create a second job.
#[test]
fn start_processing_twice_is_idempotent() {
    let h = build_harness();
    fs::create_dir_all(h.tmp.path().join("inbox").join("Author/Book")).unwrap();
    fs::write(h.tmp.path().join("inbox").join("Author/Book/track01.mp3"), b"audio").unwrap();

    let state = h.engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
    let sid = state.session_id.clone();
    run_flow_to_processing(&h.engine, &sid, "overwrite");

    let idempotency_a = IdempotencyMap::load(h.jail.clone(), &sid).unwrap();
    let first = h.engine.start_processing(&sid, true, &idempotency_a).unwrap();

    let idempotency_b = IdempotencyMap::load(h.jail.clone(), &sid).unwrap();
    let second = h.engine.start_processing(&sid, true, &idempotency_b).unwrap();
    assert_eq!(first.job_ids, second.job_ids);

    assert_eq!(h.queue.pending_import_jobs().unwrap().len(), 1);
    let drained_first = drain(&h);
    assert_eq!(drained_first.len(), 1);
    assert!(h.queue.pending_import_jobs().unwrap().is_empty());
}

// Delete-source policy removes the Inbox original only after the
// runner has re-verified the staged copy exists.
#[test]
fn delete_source_removes_inbox_original_after_copy() {
    let h = build_harness();
    let inbox_root = h.tmp.path().join("inbox");
    fs::create_dir_all(inbox_root.join("Author/Book")).unwrap();
    fs::write(inbox_root.join("Author/Book/track01.mp3"), b"audio").unwrap();

    let state = h.engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
    let sid = state.session_id.clone();

    let author_id = first_item_id(&h.engine, &sid, "select_authors");
    h.engine.submit_step(&sid, "select_authors", serde_json::json!({"selection_ids": [author_id]})).unwrap();
    let book_id = first_item_id(&h.engine, &sid, "select_books");
    h.engine.submit_step(&sid, "select_books", serde_json::json!({"selection_ids": [book_id]})).unwrap();
    h.engine.submit_step(&sid, "plan_preview_batch", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "effective_author_title", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "filename_policy", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "covers_policy", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "id3_policy", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "audio_processing", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "publish_policy", serde_json::json!({})).unwrap();
    h.engine.submit_step(&sid, "delete_source_policy", serde_json::json!({"enabled": true, "guard_enabled": true})).unwrap();
    h.engine.submit_step(&sid, "conflict_policy", serde_json::json!({"mode": "overwrite"})).unwrap();
    h.engine.submit_step(&sid, "parallelism", serde_json::json!({})).unwrap();
    let state = h.engine.submit_step(&sid, "final_summary_confirm", serde_json::json!({"confirm_start": true})).unwrap();
    assert_eq!(state.current_step_id, "processing");

    let idempotency = IdempotencyMap::load(h.jail.clone(), &sid).unwrap();
    h.engine.start_processing(&sid, true, &idempotency).unwrap();
    drain(&h);

    assert!(!inbox_root.join("Author/Book/track01.mp3").exists());
}

// A bare audio file at the Inbox root (no author directory above it)
// is itself a book unit and imports end to end.
#[test]
fn file_unit_book_imports_without_author_directory() {
    let h = build_harness();
    fs::write(h.tmp.path().join("inbox").join("lone_track.mp3"), b"audio").unwrap();

    let state = h.engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
    let sid = state.session_id.clone();
    run_flow_to_processing(&h.engine, &sid, "overwrite");

    let idempotency = IdempotencyMap::load(h.jail.clone(), &sid).unwrap();
    let result = h.engine.start_processing(&sid, true, &idempotency).unwrap();
    assert_eq!(result.job_ids.len(), 1);
    let drained = drain(&h);
    let job = h.job_service.load(&iw_ids::JobId::parse(&drained[0]).unwrap()).unwrap();
    assert_eq!(job.state, JobState::Succeeded);
}

// Once phase 2 has begun, the session is closed to further step
// submissions.
#[test]
fn phase_two_rejects_further_step_submissions() {
    let h = build_harness();
    fs::create_dir_all(h.tmp.path().join("inbox").join("Author/Book")).unwrap();
    fs::write(h.tmp.path().join("inbox").join("Author/Book/track01.mp3"), b"audio").unwrap();

    let state = h.engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
    let sid = state.session_id.clone();
    run_flow_to_processing(&h.engine, &sid, "overwrite");

    let idempotency = IdempotencyMap::load(h.jail.clone(), &sid).unwrap();
    h.engine.start_processing(&sid, true, &idempotency).unwrap();

    let err = h.engine.submit_step(&sid, "conflict_policy", serde_json::json!({"mode": "overwrite"})).unwrap_err();
    assert_eq!(err.code(), "INVARIANT_VIOLATION");
}
