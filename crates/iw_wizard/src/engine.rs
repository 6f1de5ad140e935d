//! The wizard engine (component H, §4.H): session create/resume, step
//! submission, non-linear action navigation, plan computation, and the
//! Phase-1 -> Phase-2 gate. Modeled on `casparian_intent`'s request/response
//! session operations and `casparian_sentinel::db::sessions`'s atomic
//! state persistence.

use crate::discovery_snapshot::DiscoverySnapshot;
use crate::model::{Catalog, EffectiveModel, FlowConfig};
use crate::plan::{BookDecision, DecisionUnitType, Plan};
use crate::selection::{parse_selection_expr, select_by_ids};
use crate::state::{Conflicts, ConflictItem, Derived, Mode, SessionState, SessionStatus, SourceRef};
use iw_canon::error::CoreError;
use iw_diagnostics::EventBus;
use iw_fs::{Jail, RelativePath, Root};
use iw_jobreq::builder::{self, AudioProcessingOptions, BookPlanEntry, DeleteSourceOptions};
use iw_jobs::{IdempotencyMap, JobMeta, JobService, JobType};
use std::collections::BTreeMap;
use std::sync::Arc;

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn session_root(session_id: &str) -> String {
    format!("import/sessions/{}", session_id)
}

fn rel(path: &str) -> RelativePath {
    RelativePath::parse(path).expect("engine-constructed path is always a safe literal")
}

fn state_path(sid: &str) -> RelativePath {
    rel(&format!("{}/state.json", session_root(sid)))
}

fn model_path(sid: &str) -> RelativePath {
    rel(&format!("{}/effective_model.json", session_root(sid)))
}

fn config_path(sid: &str) -> RelativePath {
    rel(&format!("{}/effective_config.json", session_root(sid)))
}

fn discovery_path(sid: &str) -> RelativePath {
    rel(&format!("{}/discovery.json", session_root(sid)))
}

fn discovery_fp_path(sid: &str) -> RelativePath {
    rel(&format!("{}/discovery_fingerprint.txt", session_root(sid)))
}

fn config_fp_path(sid: &str) -> RelativePath {
    rel(&format!("{}/effective_config_fingerprint.txt", session_root(sid)))
}

fn plan_path(sid: &str) -> RelativePath {
    rel(&format!("{}/plan.json", session_root(sid)))
}

fn conflicts_path(sid: &str) -> RelativePath {
    rel(&format!("{}/conflicts.json", session_root(sid)))
}

fn job_requests_path(sid: &str) -> RelativePath {
    rel(&format!("{}/job_requests.json", session_root(sid)))
}

fn decisions_log_path(sid: &str) -> RelativePath {
    rel(&format!("{}/decisions.jsonl", session_root(sid)))
}

/// `{preview_id, path}` (§4.H `preview_action`).
pub struct PreviewHandle {
    pub preview_id: String,
    pub path: String,
}

/// `{job_ids, batch_size}` (§6.2).
pub struct StartProcessingResult {
    pub job_ids: Vec<String>,
    pub batch_size: usize,
}

pub struct WizardEngine {
    jail: Jail,
    bus: Option<Arc<EventBus>>,
    job_service: Arc<JobService>,
}

impl WizardEngine {
    pub fn new(jail: Jail, bus: Option<Arc<EventBus>>, job_service: Arc<JobService>) -> Self {
        Self { jail, bus, job_service }
    }

    fn emit(&self, event: &str, operation: &str, data: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(event, "wizard", operation, data);
        }
    }

    /// Append-only audit entry (§6.1 `decisions.jsonl`). Best-effort: a
    /// failure here never aborts the primary operation (§7 fail-safe
    /// emissions).
    fn audit(&self, sid: &str, step_id: &str, result: &str) {
        let line = serde_json::json!({
            "ts": now_iso(),
            "step_id": step_id,
            "result": result,
        });
        if let Ok(bytes) = iw_canon::canonical_json_bytes(&line) {
            if let Ok(mut file) = self.jail.open_append(Root::Wizards, &decisions_log_path(sid)) {
                use std::io::Write;
                let _ = file.write_all(&bytes);
                let _ = writeln!(file);
            }
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, root: Root, rel: &RelativePath) -> Result<T, CoreError> {
        let file = self.jail.open_read(root, rel).map_err(|e| e.into_core_error(false))?;
        serde_json::from_reader(file).map_err(|e| CoreError::internal(e.to_string()))
    }

    fn write_json<T: serde::Serialize>(&self, root: Root, rel: &RelativePath, value: &T) -> Result<(), CoreError> {
        let v = serde_json::to_value(value).map_err(|e| CoreError::internal(e.to_string()))?;
        let bytes = iw_canon::canonical_json_bytes(&v)?;
        self.jail.write_atomic(root, rel, &bytes).map_err(|e| e.into_core_error(false))
    }

    // ---- session lifecycle -------------------------------------------------

    pub fn create_session(
        &self,
        root_name: &str,
        rel_path: &str,
        mode: Mode,
        flow_overrides: Option<serde_json::Value>,
    ) -> Result<SessionState, CoreError> {
        let root = Root::parse(root_name)
            .ok_or_else(|| CoreError::validation("$.root", "unknown_root", format!("unknown root: {}", root_name)))?;
        let source_rel = RelativePath::parse(rel_path).map_err(|e| e.into_core_error(true))?;

        if let Some(overrides) = &flow_overrides {
            if let Some(obj) = overrides.as_object() {
                for key in obj.keys() {
                    if key != "steps" {
                        return Err(CoreError::validation(
                            format!("$.{}", key),
                            "unknown_field",
                            format!("flow_overrides recognizes only 'steps', got '{}'", key),
                        ));
                    }
                }
            } else {
                return Err(CoreError::validation("$", "invalid_type", "flow_overrides must be an object"));
            }
        }

        let (snapshot, discovery_fp) = DiscoverySnapshot::build(&self.jail, root, &source_rel)?;
        let catalog = Catalog::bootstrap();
        let mut flow = FlowConfig::bootstrap();
        if let Some(overrides) = &flow_overrides {
            flow.merge_overrides(overrides)?;
        }
        let model = EffectiveModel::project(&catalog, &flow).with_selectable_items(snapshot.authors.clone(), snapshot.books.clone());
        let config_fp = iw_canon::fingerprint(&flow)?;
        let model_fp = iw_canon::fingerprint(&model)?;

        let session_id = {
            let seed = format!("{}|{}|{}|{}|{}|{}", root_name, source_rel.as_str(), mode.as_str(), model_fp, discovery_fp, config_fp);
            let full = iw_canon::fingerprint_str(&seed);
            full[..16].to_string()
        };

        if self.jail.exists(Root::Wizards, &state_path(&session_id)) {
            let mut state: SessionState = self.read_json(Root::Wizards, &state_path(&session_id))?;
            if state.model_fingerprint != model_fp {
                state.model_fingerprint = model_fp;
                state.updated_at = now_iso();
                self.write_json(Root::Wizards, &state_path(&session_id), &state)?;
            }
            self.emit(
                "session.resume",
                "create_session",
                serde_json::json!({"session_id": session_id, "model_fingerprint": state.model_fingerprint}),
            );
            return Ok(state);
        }

        self.write_json(Root::Wizards, &model_path(&session_id), &model)?;
        self.write_json(Root::Wizards, &config_path(&session_id), &flow)?;
        self.write_json(Root::Wizards, &discovery_path(&session_id), &snapshot)?;
        self.jail
            .write_atomic(Root::Wizards, &discovery_fp_path(&session_id), discovery_fp.as_bytes())
            .map_err(|e| e.into_core_error(false))?;
        self.jail
            .write_atomic(Root::Wizards, &config_fp_path(&session_id), config_fp.as_bytes())
            .map_err(|e| e.into_core_error(false))?;

        let first_step = model.step_order.first().cloned().unwrap_or_else(|| "select_authors".to_string());
        let created = now_iso();
        let state = SessionState {
            session_id: session_id.clone(),
            created_at: created.clone(),
            updated_at: created,
            phase: 1,
            mode,
            source: SourceRef { root: root_name.to_string(), rel_path: source_rel.as_str().to_string() },
            current_step_id: first_step,
            completed_step_ids: Vec::new(),
            answers: BTreeMap::new(),
            inputs: BTreeMap::new(),
            computed: serde_json::Map::new(),
            selected_author_ids: Vec::new(),
            selected_book_ids: Vec::new(),
            effective_author_title: BTreeMap::new(),
            derived: Derived { discovery_fingerprint: Some(discovery_fp), effective_config_fingerprint: Some(config_fp), conflict_fingerprint: None },
            conflicts: Conflicts::default(),
            status: SessionStatus::InProgress,
            model_fingerprint: model_fp,
            errors: Vec::new(),
            sequence: 0,
        };
        self.write_json(Root::Wizards, &state_path(&session_id), &state)?;
        self.emit(
            "session.start",
            "create_session",
            serde_json::json!({"session_id": session_id, "model_fingerprint": state.model_fingerprint}),
        );
        Ok(state)
    }

    pub fn get_state(&self, session_id: &str) -> Result<SessionState, CoreError> {
        self.read_json(Root::Wizards, &state_path(session_id))
    }

    fn save_state(&self, state: &mut SessionState) -> Result<(), CoreError> {
        state.updated_at = now_iso();
        self.write_json(Root::Wizards, &state_path(&state.session_id), state)
    }

    pub fn get_step_definition(&self, session_id: &str, step_id: &str) -> Result<Vec<crate::model::FieldSchema>, CoreError> {
        let model: EffectiveModel = self.read_json(Root::Wizards, &model_path(session_id))?;
        let mut fields = model
            .catalog
            .step(step_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("unknown step_id: {}", step_id)))?;

        // select_books narrows to the books under the authors already
        // chosen in select_authors, still in discovery order.
        if step_id == "select_books" {
            let state = self.get_state(session_id)?;
            if !state.selected_author_ids.is_empty() {
                let snapshot = self.load_discovery(session_id)?;
                let scoped = snapshot.books_for_authors(&state.selected_author_ids);
                if let Some(field) = fields.first_mut() {
                    field.items = Some(scoped);
                }
            }
        }
        Ok(fields)
    }

    fn load_model(&self, session_id: &str) -> Result<EffectiveModel, CoreError> {
        self.read_json(Root::Wizards, &model_path(session_id))
    }

    fn load_discovery(&self, session_id: &str) -> Result<DiscoverySnapshot, CoreError> {
        self.read_json(Root::Wizards, &discovery_path(session_id))
    }

    fn require_phase_one(&self, state: &SessionState) -> Result<(), CoreError> {
        if state.is_phase_two() {
            return Err(CoreError::invariant_reason("phase_locked", "session has already entered phase 2"));
        }
        if state.status != SessionStatus::InProgress {
            return Err(CoreError::invariant_reason(
                "session_not_in_progress",
                format!("session status is {:?}, not in_progress", state.status),
            ));
        }
        Ok(())
    }

    // ---- step submission ----------------------------------------------------

    pub fn submit_step(&self, session_id: &str, step_id: &str, payload: serde_json::Value) -> Result<SessionState, CoreError> {
        let mut state = self.get_state(session_id)?;
        self.require_phase_one(&state)?;
        if self.load_model(session_id)?.catalog.step(step_id).is_none() {
            return Err(CoreError::not_found(format!("unknown step_id: {}", step_id)));
        }
        let fields = self.get_step_definition(session_id, step_id)?;
        let obj = payload
            .as_object()
            .ok_or_else(|| CoreError::validation("$", "invalid_type", "payload must be an object"))?;

        let canonical = self.validate_and_canonicalize(step_id, &fields, obj)?;
        let selection_ids: Vec<String> = canonical
            .get("selection_ids")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        state.record_answer(step_id, canonical);
        self.audit(session_id, step_id, "accepted");

        match step_id {
            "select_authors" => state.selected_author_ids = selection_ids,
            "select_books" => state.selected_book_ids = selection_ids,
            "conflict_policy" => state.conflicts.policy = Some(state.conflict_policy_mode().to_string()),
            _ => {}
        }

        let next = self.advance_from(session_id, &mut state)?;
        state.current_step_id = next;
        self.save_state(&mut state)?;
        self.emit(
            "step.submit",
            "submit_step",
            serde_json::json!({"session_id": session_id, "step_id": step_id, "model_fingerprint": state.model_fingerprint}),
        );
        Ok(state)
    }

    fn validate_and_canonicalize(
        &self,
        step_id: &str,
        fields: &[crate::model::FieldSchema],
        obj: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, CoreError> {
        use crate::model::FieldType;

        // 1. unknown_field
        for key in obj.keys() {
            let base = key.strip_suffix("_expr").or_else(|| key.strip_suffix("_ids")).unwrap_or(key);
            let known = fields.iter().any(|f| &f.name == base || &f.name == key);
            if !known {
                return Err(CoreError::validation(format!("$.{}", key), "unknown_field", format!("unknown field: {}", key)));
            }
        }

        let mut out = serde_json::Map::new();

        for field in fields {
            let expr_key = format!("{}_expr", field.name);
            let ids_key = format!("{}_ids", field.name);

            if field.field_type == FieldType::MultiSelectIndexed {
                let items = field.items.clone().unwrap_or_default();
                let resolved: Vec<String> = if let Some(expr) = obj.get(&expr_key) {
                    let expr = expr
                        .as_str()
                        .ok_or_else(|| CoreError::validation(format!("$.{}", expr_key), "invalid_type", "expr must be a string"))?;
                    let indices = parse_selection_expr(expr, items.len())?;
                    indices.into_iter().filter_map(|i| items.get(i - 1)).map(|i| i.item_id.clone()).collect()
                } else if let Some(ids) = obj.get(&ids_key) {
                    let ids: Vec<String> = ids
                        .as_array()
                        .ok_or_else(|| CoreError::validation(format!("$.{}", ids_key), "invalid_type", "ids must be an array"))?
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| CoreError::validation(format!("$.{}", ids_key), "invalid_type", "ids must be strings"))?;
                    let selected = select_by_ids(&items, &ids, |i| &i.item_id)?;
                    selected.into_iter().map(|i| i.item_id.clone()).collect()
                } else if field.required {
                    return Err(CoreError::validation(
                        format!("$.{}", field.name),
                        "missing_required",
                        format!("missing required selection for {}", field.name),
                    ));
                } else {
                    Vec::new()
                };
                out.insert(format!("{}_ids", field.name), serde_json::json!(resolved));
                continue;
            }

            let Some(value) = obj.get(&field.name) else {
                if field.required {
                    return Err(CoreError::validation(
                        format!("$.{}", field.name),
                        "missing_required",
                        format!("missing required field: {}", field.name),
                    ));
                }
                continue;
            };

            let canonical_value = match field.field_type {
                FieldType::Text | FieldType::Select => {
                    let s = value
                        .as_str()
                        .ok_or_else(|| CoreError::validation(format!("$.{}", field.name), "invalid_type", "expected string"))?;
                    let s = if field.name == "mode" && step_id == "conflict_policy" {
                        let lower = s.to_ascii_lowercase();
                        if !["ask", "overwrite", "skip", "version_suffix"].contains(&lower.as_str()) {
                            return Err(CoreError::validation(
                                "$.mode",
                                "invalid_enum_value",
                                format!("unknown conflict_policy.mode: {}", lower),
                            ));
                        }
                        lower
                    } else {
                        s.to_string()
                    };
                    serde_json::json!(s)
                }
                FieldType::Toggle | FieldType::Confirm => {
                    let b = value
                        .as_bool()
                        .ok_or_else(|| CoreError::validation(format!("$.{}", field.name), "invalid_type", "expected bool"))?;
                    serde_json::json!(b)
                }
                FieldType::Number => {
                    let n = value
                        .as_f64()
                        .ok_or_else(|| CoreError::validation(format!("$.{}", field.name), "invalid_type", "expected number"))?;
                    serde_json::json!(n)
                }
                FieldType::TableEdit => value.clone(),
                FieldType::MultiSelectIndexed => unreachable!(),
            };
            out.insert(field.name.clone(), canonical_value);
        }
        Ok(serde_json::Value::Object(out))
    }

    // ---- non-linear navigation -----------------------------------------------

    fn next_linear(&self, model: &EffectiveModel, current: &str) -> Option<String> {
        let idx = model.step_order.iter().position(|s| s == current)?;
        model.step_order.get(idx + 1).cloned()
    }

    /// Resolve the step following `state.current_step_id`, applying the
    /// non-linear edges from §4.H, and performing their side effects
    /// (computed-plan invocation, conflict scanning).
    fn advance_from(&self, session_id: &str, state: &mut SessionState) -> Result<String, CoreError> {
        let model = self.load_model(session_id)?;
        let current = state.current_step_id.clone();

        match current.as_str() {
            "final_summary_confirm" => {
                let confirmed = state
                    .answer("final_summary_confirm")
                    .and_then(|v| v.get("confirm_start"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if !confirmed {
                    return Ok(current);
                }
                if state.conflict_policy_mode() == "ask" {
                    let plan = self.try_load_plan(session_id)?;
                    if let Some(plan) = plan {
                        let conflicts = self.scan_conflicts(&plan)?;
                        state.sequence += 1;
                        let drift = state
                            .derived
                            .conflict_fingerprint
                            .as_deref()
                            .map(|prev| prev != conflicts.0.as_str())
                            .unwrap_or(false);
                        state.derived.conflict_fingerprint = Some(conflicts.0.clone());
                        state.conflicts.present = conflicts.1.present;
                        state.conflicts.items = conflicts.1.items;
                        if conflicts.1.present && (!state.conflicts.resolved || drift) {
                            state.conflicts.resolved = false;
                            return Ok("resolve_conflicts_batch".to_string());
                        }
                    }
                    Ok("processing".to_string())
                } else {
                    Ok("processing".to_string())
                }
            }
            "resolve_conflicts_batch" => {
                if state.conflict_policy_mode() == "ask" {
                    let confirmed = state
                        .answer("resolve_conflicts_batch")
                        .and_then(|v| v.get("confirm"))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if !confirmed {
                        return Err(CoreError::validation("$.confirm", "missing_required", "resolve_conflicts_batch requires confirm=true"));
                    }
                }
                state.conflicts.resolved = true;
                Ok("final_summary_confirm".to_string())
            }
            "plan_preview_batch" => {
                let _ = self.compute_plan(session_id)?;
                Ok(self.next_linear(&model, &current).unwrap_or(current))
            }
            _ => Ok(self.next_linear(&model, &current).unwrap_or(current)),
        }
    }

    pub fn apply_action(&self, session_id: &str, action: &str) -> Result<SessionState, CoreError> {
        let mut state = self.get_state(session_id)?;
        self.require_phase_one(&state)?;

        match action {
            "cancel" => {
                state.status = SessionStatus::Aborted;
                self.save_state(&mut state)?;
                self.emit("session.resume", "apply_action", serde_json::json!({"session_id": session_id, "action": "cancel"}));
                Ok(state)
            }
            "back" => {
                state.completed_step_ids.pop();
                state.current_step_id = state
                    .completed_step_ids
                    .last()
                    .cloned()
                    .unwrap_or_else(|| self.load_model(session_id).map(|m| m.step_order.first().cloned().unwrap_or_default()).unwrap_or_default());
                self.save_state(&mut state)?;
                Ok(state)
            }
            "next" => {
                let next = self.advance_from(session_id, &mut state)?;
                state.current_step_id = next;
                self.save_state(&mut state)?;
                Ok(state)
            }
            other => Err(CoreError::validation("$.action", "unknown_action", format!("unknown action: {}", other))),
        }
    }

    // ---- preview ---------------------------------------------------------

    pub fn preview_action(&self, session_id: &str, step_id: &str, payload: serde_json::Value) -> Result<PreviewHandle, CoreError> {
        let state = self.get_state(session_id)?;
        let body = serde_json::json!({
            "session_id": session_id,
            "step_id": step_id,
            "payload": payload,
            "model_fingerprint": state.model_fingerprint,
        });
        let fp = iw_canon::fingerprint_json(&body)?;
        let path = format!("import/previews/{}.json", fp);
        self.jail
            .write_atomic(Root::Wizards, &rel(&path), &iw_canon::canonical_json_bytes(&body)?)
            .map_err(|e| e.into_core_error(false))?;
        Ok(PreviewHandle { preview_id: fp, path })
    }

    // ---- plan & conflicts --------------------------------------------------

    fn try_load_plan(&self, session_id: &str) -> Result<Option<Plan>, CoreError> {
        if self.jail.exists(Root::Wizards, &plan_path(session_id)) {
            Ok(Some(self.read_json(Root::Wizards, &plan_path(session_id))?))
        } else {
            Ok(None)
        }
    }

    pub fn compute_plan(&self, session_id: &str) -> Result<Plan, CoreError> {
        let mut state = self.get_state(session_id)?;
        let snapshot = self.load_discovery(session_id)?;

        let mut books = Vec::new();
        let mut labels = BTreeMap::new();
        for book_id in &state.selected_book_ids {
            let Some(meta) = snapshot.book_meta.get(book_id) else {
                state.current_step_id = "select_books".to_string();
                self.save_state(&mut state)?;
                return Err(CoreError::validation(
                    "$.selected_book_ids",
                    "invalid_selection",
                    format!("selected book id not found in discovery: {}", book_id),
                ));
            };
            labels.insert(book_id.clone(), format!("{} - {}", meta.author, meta.title));
            books.push(BookDecision {
                book_id: book_id.clone(),
                book_rel_path: meta.relative_path.clone(),
                unit_type: DecisionUnitType::from(meta.unit_type),
                author: meta.author.clone(),
                title: meta.title.clone(),
                handling_mode: state.mode.as_str().to_string(),
                rename_preview: BTreeMap::new(),
                options: serde_json::Map::new(),
            });
        }

        let plan = Plan::from_books(books, &labels);
        self.write_json(Root::Wizards, &plan_path(session_id), &plan)?;
        self.emit("plan.compute", "compute_plan", serde_json::json!({"session_id": session_id, "book_count": plan.books.len()}));
        Ok(plan)
    }

    /// `(conflict_fingerprint, Conflicts)` for `plan`, checked against the
    /// publish target (the Outbox root) regardless of mode -- see
    /// DESIGN.md for why conflict scanning targets Outbox even in stage
    /// mode, where the runner's copy target is a fresh per-job directory.
    fn scan_conflicts(&self, plan: &Plan) -> Result<(String, Conflicts), CoreError> {
        let mut items = Vec::new();
        for book in &plan.books {
            let target_rel = rel(&book.book_rel_path);
            if self.jail.exists(Root::Outbox, &target_rel) {
                items.push(ConflictItem { root: "outbox".to_string(), relative_path: book.book_rel_path.clone() });
            }
        }
        items.sort();
        let fp = iw_canon::fingerprint_json(&serde_json::to_value(&items).map_err(|e| CoreError::internal(e.to_string()))?)?;
        let present = !items.is_empty();
        Ok((fp, Conflicts { present, items, resolved: !present, policy: None }))
    }

    // ---- phase 2 entry ------------------------------------------------------

    pub fn start_processing(&self, session_id: &str, confirm: bool, idempotency: &IdempotencyMap) -> Result<StartProcessingResult, CoreError> {
        let mut state = self.get_state(session_id)?;

        if state.is_phase_two() {
            let doc: serde_json::Value = self.read_json(Root::Wizards, &job_requests_path(session_id))?;
            let key = doc.get("idempotency_key").and_then(|v| v.as_str()).unwrap_or_default();
            let job_id = idempotency.get(key).ok_or_else(|| CoreError::internal("phase-2 session missing idempotency record"))?;
            let batch_size = doc.get("actions").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0);
            return Ok(StartProcessingResult { job_ids: vec![job_id], batch_size });
        }

        if state.status != SessionStatus::InProgress {
            return Err(CoreError::invariant_reason("session_not_in_progress", "session is not in_progress"));
        }
        if !confirm {
            return Err(CoreError::validation("$.confirm", "missing_required", "start_processing requires confirm=true"));
        }
        let confirm_start = state
            .answer("final_summary_confirm")
            .and_then(|v| v.get("confirm_start"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !confirm_start {
            return Err(CoreError::invariant_reason("final_summary_confirm_required", "final_summary_confirm.confirm_start must be true"));
        }

        let plan = self.try_load_plan(session_id)?.ok_or_else(|| CoreError::invariant_reason("plan_missing", "no plan computed for session"))?;
        let (fresh_fp, fresh_conflicts) = self.scan_conflicts(&plan)?;
        state.sequence += 1;
        let mode_is_ask = state.conflict_policy_mode() == "ask";

        if mode_is_ask {
            let resolved_matches = state.conflicts.resolved
                && state.derived.conflict_fingerprint.as_deref() == Some(fresh_fp.as_str());
            if fresh_conflicts.present && !resolved_matches {
                return Err(CoreError::conflicts_unresolved("conflicts present and unresolved under policy 'ask'"));
            }
        } else if let Some(prev_fp) = state.derived.conflict_fingerprint.as_deref() {
            if prev_fp != fresh_fp {
                return Err(CoreError::invariant_reason("conflicts_changed", "conflict fingerprint drifted since last scan"));
            }
        }
        state.derived.conflict_fingerprint = Some(fresh_fp.clone());
        self.write_json(Root::Wizards, &conflicts_path(session_id), &fresh_conflicts)?;

        let config_fp = state.derived.effective_config_fingerprint.clone().unwrap_or_default();
        let discovery_fp = state.derived.discovery_fingerprint.clone().unwrap_or_default();
        let books: Vec<BookPlanEntry> = plan
            .books
            .iter()
            .map(|b| BookPlanEntry {
                book_id: b.book_id.clone(),
                book_rel_path: b.book_rel_path.clone(),
                title: b.title.clone(),
                author: b.author.clone(),
                unit_type: match b.unit_type {
                    DecisionUnitType::Dir => "dir".to_string(),
                    DecisionUnitType::File => "file".to_string(),
                },
            })
            .collect();
        let audio_processing = state
            .answer("audio_processing")
            .and_then(|v| serde_json::from_value::<AudioProcessingOptions>(v.clone()).ok())
            .unwrap_or_default();
        let delete_source = state
            .answer("delete_source_policy")
            .and_then(|v| serde_json::from_value::<DeleteSourceOptions>(v.clone()).ok())
            .unwrap_or_default();

        let job_doc = builder::build(
            session_id,
            state.mode.as_str(),
            &state.source.root,
            &config_fp,
            &state.model_fingerprint,
            &discovery_fp,
            &fresh_fp,
            &books,
            audio_processing,
            delete_source,
        )?;
        let idempotency_key = job_doc.idempotency_key.clone().unwrap_or_default();
        let doc = serde_json::to_value(&job_doc).map_err(|e| CoreError::internal(e.to_string()))?;

        self.write_json(Root::Wizards, &job_requests_path(session_id), &doc)?;

        state.phase = 2;
        state.status = SessionStatus::Processing;
        self.save_state(&mut state)?;
        self.emit("finalize.request", "start_processing", serde_json::json!({"session_id": session_id, "idempotency_key": idempotency_key}));

        let job_id = if let Some(existing) = idempotency.get(&idempotency_key) {
            existing
        } else {
            let meta = JobMeta {
                source: Some("import".to_string()),
                session_id: Some(session_id.to_string()),
                idempotency_key: Some(idempotency_key.clone()),
                job_requests_path: Some(format!("wizards:{}", job_requests_path(session_id).as_str())),
                run_id: None,
                book_rel_path: None,
                mode: Some(state.mode.as_str().to_string()),
                unit_type: None,
                decision_json: Some(doc.clone()),
                retry_of: None,
                warnings: Vec::new(),
            };
            let job = self.job_service.create(JobType::Import, meta)?;
            idempotency.insert(&idempotency_key, job.job_id.as_str())?;
            job.job_id.as_str().to_string()
        };

        Ok(StartProcessingResult { job_ids: vec![job_id], batch_size: actions_len(&doc) })
    }
}

fn actions_len(doc: &serde_json::Value) -> usize {
    doc.get("actions").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iw_fs::RootPaths;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, WizardEngine) {
        let tmp = TempDir::new().unwrap();
        let book_dir = tmp.path().join("inbox/Author/Book");
        fs::create_dir_all(&book_dir).unwrap();
        fs::write(book_dir.join("track01.mp3"), b"audio-bytes").unwrap();
        fs::create_dir_all(tmp.path().join("jobs")).unwrap();
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
        let engine = WizardEngine::new(jail, None, job_service);
        (tmp, engine)
    }

    fn first_item_id(engine: &WizardEngine, sid: &str, step_id: &str) -> String {
        let fields = engine.get_step_definition(sid, step_id).unwrap();
        fields[0].items.as_ref().unwrap()[0].item_id.clone()
    }

    /// Drives a freshly created session through every mandatory/optional
    /// step up to (and not including) `final_summary_confirm`, leaving
    /// `current_step_id == "final_summary_confirm"`.
    fn drive_to_final_summary(engine: &WizardEngine, sid: &str, conflict_mode: &str) {
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
        let state = engine.submit_step(sid, "parallelism", serde_json::json!({})).unwrap();
        assert_eq!(state.current_step_id, "final_summary_confirm");
    }

    // ---- session lifecycle -------------------------------------------------

    #[test]
    fn create_session_is_deterministic_and_resumes_in_place_state() {
        let (_tmp, engine) = fixture();
        let first = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let again = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        assert_eq!(first.session_id, again.session_id);
        assert_eq!(first.current_step_id, "select_authors");

        let author_id = first_item_id(&engine, &first.session_id, "select_authors");
        engine
            .submit_step(&first.session_id, "select_authors", serde_json::json!({"selection_ids": [author_id]}))
            .unwrap();

        // Resuming the same source/mode must read the persisted state back
        // rather than re-create a blank session.
        let resumed = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        assert_eq!(resumed.session_id, first.session_id);
        assert_eq!(resumed.current_step_id, "select_books");
    }

    #[test]
    fn unknown_root_is_rejected() {
        let (_tmp, engine) = fixture();
        let err = engine.create_session("bogus_root", ".", Mode::Stage, None).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    // ---- step submission validation ----------------------------------------

    #[test]
    fn submit_step_rejects_unknown_field() {
        let (_tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let err = engine
            .submit_step(&state.session_id, "conflict_policy", serde_json::json!({"mode": "overwrite", "bogus": true}))
            .unwrap_err();
        assert_eq!(err.details()[0].reason, "unknown_field");
    }

    #[test]
    fn submit_step_rejects_missing_required_field() {
        let (_tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let err = engine.submit_step(&state.session_id, "conflict_policy", serde_json::json!({})).unwrap_err();
        assert_eq!(err.details()[0].reason, "missing_required");
    }

    #[test]
    fn submit_step_rejects_invalid_type() {
        let (_tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let err = engine.submit_step(&state.session_id, "conflict_policy", serde_json::json!({"mode": 123})).unwrap_err();
        assert_eq!(err.details()[0].reason, "invalid_type");
    }

    #[test]
    fn submit_step_rejects_unknown_conflict_policy_mode() {
        let (_tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let err = engine
            .submit_step(&state.session_id, "conflict_policy", serde_json::json!({"mode": "nonsense"}))
            .unwrap_err();
        assert_eq!(err.details()[0].reason, "invalid_enum_value");
    }

    #[test]
    fn multi_select_indexed_accepts_expr_and_ids() {
        let (_tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();

        let via_expr = engine.submit_step(&state.session_id, "select_authors", serde_json::json!({"selection_expr": "1"})).unwrap();
        assert_eq!(via_expr.selected_author_ids.len(), 1);

        let author_id = via_expr.selected_author_ids[0].clone();
        let via_ids = engine
            .submit_step(&state.session_id, "select_books", serde_json::json!({"selection_ids": [first_item_id(&engine, &state.session_id, "select_books")]}))
            .unwrap();
        assert_eq!(via_ids.selected_book_ids.len(), 1);
        let _ = author_id;
    }

    #[test]
    fn multi_select_indexed_rejects_unknown_id() {
        let (_tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let err = engine
            .submit_step(&state.session_id, "select_authors", serde_json::json!({"selection_ids": ["author:doesnotexist"]}))
            .unwrap_err();
        assert_eq!(err.details()[0].reason, "unknown_id");
    }

    // ---- non-linear navigation & phase-2 gate ------------------------------

    #[test]
    fn overwrite_policy_confirms_straight_to_processing() {
        let (_tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let sid = state.session_id.clone();
        drive_to_final_summary(&engine, &sid, "overwrite");

        let state = engine
            .submit_step(&sid, "final_summary_confirm", serde_json::json!({"confirm_start": true}))
            .unwrap();
        assert_eq!(state.current_step_id, "processing");
    }

    #[test]
    fn ask_policy_routes_through_conflict_resolution_and_back() {
        let (tmp, engine) = fixture();
        // Pre-populate Outbox with the path the plan will target, so
        // scan_conflicts finds a collision under the "ask" policy.
        fs::create_dir_all(tmp.path().join("outbox/Author/Book")).unwrap();
        fs::write(tmp.path().join("outbox/Author/Book/track01.mp3"), b"existing").unwrap();

        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let sid = state.session_id.clone();
        drive_to_final_summary(&engine, &sid, "ask");

        let state = engine
            .submit_step(&sid, "final_summary_confirm", serde_json::json!({"confirm_start": true}))
            .unwrap();
        assert_eq!(state.current_step_id, "resolve_conflicts_batch");
        assert!(state.conflicts.present);
        assert!(!state.conflicts.resolved);

        let state = engine.submit_step(&sid, "resolve_conflicts_batch", serde_json::json!({"confirm": true})).unwrap();
        assert_eq!(state.current_step_id, "final_summary_confirm");
        assert!(state.conflicts.resolved);

        let state = engine
            .submit_step(&sid, "final_summary_confirm", serde_json::json!({"confirm_start": true}))
            .unwrap();
        assert_eq!(state.current_step_id, "processing");
        assert!(state.sequence >= 2);
    }

    #[test]
    fn resolve_conflicts_batch_requires_confirm_under_ask_policy() {
        let (tmp, engine) = fixture();
        fs::create_dir_all(tmp.path().join("outbox/Author/Book")).unwrap();
        fs::write(tmp.path().join("outbox/Author/Book/track01.mp3"), b"existing").unwrap();

        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let sid = state.session_id.clone();
        drive_to_final_summary(&engine, &sid, "ask");
        engine.submit_step(&sid, "final_summary_confirm", serde_json::json!({"confirm_start": true})).unwrap();

        let err = engine.submit_step(&sid, "resolve_conflicts_batch", serde_json::json!({"confirm": false})).unwrap_err();
        assert_eq!(err.details()[0].reason, "missing_required");
    }

    // ---- phase-2 entry, idempotency, and the phase lock --------------------

    #[test]
    fn start_processing_is_idempotent_and_locks_phase_one() {
        let (tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let sid = state.session_id.clone();
        drive_to_final_summary(&engine, &sid, "overwrite");
        engine.submit_step(&sid, "final_summary_confirm", serde_json::json!({"confirm_start": true})).unwrap();

        let roots = RootPaths::new(
            tmp.path().join("inbox"),
            tmp.path().join("stage"),
            tmp.path().join("jobs"),
            tmp.path().join("outbox"),
            tmp.path().join("config"),
            tmp.path().join("wizards"),
        );
        let jail = Jail::new(roots, None);
        let idempotency = IdempotencyMap::load(jail, &sid).unwrap();

        let first = engine.start_processing(&sid, true, &idempotency).unwrap();
        assert_eq!(first.job_ids.len(), 1);
        assert_eq!(first.batch_size, 1);

        // A fresh reload of the idempotency map (simulating a new process)
        // must still resolve the same job id rather than create a second one.
        let roots2 = RootPaths::new(
            tmp.path().join("inbox"),
            tmp.path().join("stage"),
            tmp.path().join("jobs"),
            tmp.path().join("outbox"),
            tmp.path().join("config"),
            tmp.path().join("wizards"),
        );
        let jail2 = Jail::new(roots2, None);
        let idempotency2 = IdempotencyMap::load(jail2, &sid).unwrap();
        let second = engine.start_processing(&sid, true, &idempotency2).unwrap();
        assert_eq!(second.job_ids, first.job_ids);

        // Phase 2 is closed to further step submissions.
        let err = engine.submit_step(&sid, "filename_policy", serde_json::json!({})).unwrap_err();
        assert_eq!(err.code(), "INVARIANT_VIOLATION");
        assert_eq!(err.details()[0].reason, "phase_locked");
    }

    #[test]
    fn start_processing_rejects_without_confirm() {
        let (tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let sid = state.session_id.clone();
        drive_to_final_summary(&engine, &sid, "overwrite");
        engine.submit_step(&sid, "final_summary_confirm", serde_json::json!({"confirm_start": true})).unwrap();

        let roots = RootPaths::new(
            tmp.path().join("inbox"),
            tmp.path().join("stage"),
            tmp.path().join("jobs"),
            tmp.path().join("outbox"),
            tmp.path().join("config"),
            tmp.path().join("wizards"),
        );
        let jail = Jail::new(roots, None);
        let idempotency = IdempotencyMap::load(jail, &sid).unwrap();
        let err = engine.start_processing(&sid, false, &idempotency).unwrap_err();
        assert_eq!(err.details()[0].reason, "missing_required");
    }

    #[test]
    fn apply_action_cancel_sets_aborted_status() {
        let (_tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let state = engine.apply_action(&state.session_id, "cancel").unwrap();
        assert_eq!(state.status, SessionStatus::Aborted);
    }

    #[test]
    fn apply_action_back_pops_completed_steps() {
        let (_tmp, engine) = fixture();
        let state = engine.create_session("inbox", ".", Mode::Stage, None).unwrap();
        let sid = state.session_id.clone();
        let author_id = first_item_id(&engine, &sid, "select_authors");
        engine.submit_step(&sid, "select_authors", serde_json::json!({"selection_ids": [author_id]})).unwrap();
        let state = engine.apply_action(&sid, "back").unwrap();
        assert_eq!(state.current_step_id, "select_authors");
    }
}
