//! Wizard definition, catalog, flow config, and the effective model that
//! projects one through the other (§3, §4.H).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The fixed step order (§3). Mandatory steps cannot be disabled;
/// `resolve_conflicts_batch` is conditional on conflict policy.
pub const STEP_ORDER: &[&str] = &[
    "select_authors",
    "select_books",
    "plan_preview_batch",
    "effective_author_title",
    "filename_policy",
    "covers_policy",
    "id3_policy",
    "audio_processing",
    "publish_policy",
    "delete_source_policy",
    "conflict_policy",
    "parallelism",
    "final_summary_confirm",
    "resolve_conflicts_batch",
    "processing",
];

pub const MANDATORY_STEPS: &[&str] = &[
    "select_authors",
    "select_books",
    "plan_preview_batch",
    "conflict_policy",
    "final_summary_confirm",
    "processing",
];

pub fn is_mandatory(step_id: &str) -> bool {
    MANDATORY_STEPS.contains(&step_id)
}

pub fn is_known_step(step_id: &str) -> bool {
    STEP_ORDER.contains(&step_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Toggle,
    Confirm,
    Select,
    Number,
    MultiSelectIndexed,
    TableEdit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub constraints: serde_json::Map<String, serde_json::Value>,
    /// For `multi_select_indexed`: the selectable items, in discovery order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<SelectionItem>>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
            constraints: serde_json::Map::new(),
            items: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionItem {
    pub item_id: String,
    pub label: String,
}

/// Immutable for the life of a session (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub steps: BTreeMap<String, Vec<FieldSchema>>,
}

impl Catalog {
    /// The catalog shape used throughout the workspace: each step carries
    /// the field schema the original's `CatalogModel` bootstraps on first
    /// use (§6.1 `import/catalog/catalog.json`).
    pub fn bootstrap() -> Self {
        let mut steps = BTreeMap::new();
        steps.insert(
            "select_authors".to_string(),
            vec![FieldSchema::new("selection", FieldType::MultiSelectIndexed, true)],
        );
        steps.insert(
            "select_books".to_string(),
            vec![FieldSchema::new("selection", FieldType::MultiSelectIndexed, true)],
        );
        steps.insert("plan_preview_batch".to_string(), vec![]);
        steps.insert(
            "effective_author_title".to_string(),
            vec![
                FieldSchema::new("author", FieldType::Text, false),
                FieldSchema::new("title", FieldType::Text, false),
            ],
        );
        steps.insert(
            "filename_policy".to_string(),
            vec![FieldSchema::new("pattern", FieldType::Text, false)],
        );
        steps.insert(
            "covers_policy".to_string(),
            vec![FieldSchema::new("enabled", FieldType::Toggle, false)],
        );
        steps.insert(
            "id3_policy".to_string(),
            vec![FieldSchema::new("enabled", FieldType::Toggle, false)],
        );
        steps.insert(
            "audio_processing".to_string(),
            vec![
                FieldSchema::new("enabled", FieldType::Toggle, false),
                FieldSchema::new("confirmed", FieldType::Confirm, false),
                FieldSchema::new("bitrate_mode", FieldType::Select, false),
            ],
        );
        steps.insert(
            "publish_policy".to_string(),
            vec![FieldSchema::new("target", FieldType::Select, false)],
        );
        steps.insert(
            "delete_source_policy".to_string(),
            vec![
                FieldSchema::new("enabled", FieldType::Toggle, false),
                FieldSchema::new("guard_enabled", FieldType::Toggle, false),
            ],
        );
        steps.insert(
            "conflict_policy".to_string(),
            vec![FieldSchema::new("mode", FieldType::Select, true)],
        );
        steps.insert(
            "parallelism".to_string(),
            vec![FieldSchema::new("parallelism_n", FieldType::Number, false)],
        );
        steps.insert(
            "final_summary_confirm".to_string(),
            vec![FieldSchema::new("confirm_start", FieldType::Confirm, true)],
        );
        steps.insert(
            "resolve_conflicts_batch".to_string(),
            vec![FieldSchema::new("confirm", FieldType::Confirm, true)],
        );
        steps.insert("processing".to_string(), vec![]);
        Self { steps }
    }

    pub fn step(&self, step_id: &str) -> Option<&Vec<FieldSchema>> {
        self.steps.get(step_id)
    }
}

/// V1 document: only optional steps may be toggled (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub version: u32,
    pub steps: BTreeMap<String, StepToggle>,
    #[serde(default)]
    pub verbosity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepToggle {
    pub enabled: bool,
}

impl FlowConfig {
    pub fn bootstrap() -> Self {
        Self {
            version: 1,
            steps: BTreeMap::new(),
            verbosity: None,
        }
    }

    pub fn is_enabled(&self, step_id: &str) -> bool {
        if is_mandatory(step_id) {
            return true;
        }
        self.steps.get(step_id).map(|t| t.enabled).unwrap_or(true)
    }

    /// Apply `{steps: {<step_id>: {enabled}}}` overrides. Enabling a
    /// mandatory step is a no-op; disabling one is a hard error (§3).
    pub fn merge_overrides(&mut self, overrides: &serde_json::Value) -> Result<(), iw_canon::error::CoreError> {
        use iw_canon::error::CoreError;
        let Some(steps) = overrides.get("steps").and_then(|v| v.as_object()) else {
            return Ok(());
        };
        for (step_id, cfg) in steps {
            if !is_known_step(step_id) {
                return Err(CoreError::validation(
                    format!("$.steps.{}", step_id),
                    "unknown_field",
                    format!("unknown step id: {}", step_id),
                ));
            }
            let enabled = cfg
                .get("enabled")
                .and_then(|v| v.as_bool())
                .ok_or_else(|| {
                    CoreError::validation(
                        format!("$.steps.{}.enabled", step_id),
                        "invalid_type",
                        "enabled must be a bool",
                    )
                })?;
            if is_mandatory(step_id) && !enabled {
                return Err(CoreError::invariant_reason(
                    "mandatory_step_disabled",
                    format!("step {} is mandatory and cannot be disabled", step_id),
                ));
            }
            self.steps.insert(step_id.clone(), StepToggle { enabled });
        }
        Ok(())
    }
}

/// Projection of [`Catalog`] under a [`FlowConfig`], with discovery-derived
/// selectable items injected into `select_authors`/`select_books`. Frozen
/// per session once written to `effective_model.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveModel {
    pub catalog: Catalog,
    pub step_order: Vec<String>,
}

impl EffectiveModel {
    pub fn project(catalog: &Catalog, flow_config: &FlowConfig) -> Self {
        let step_order = STEP_ORDER
            .iter()
            .filter(|s| flow_config.is_enabled(s))
            .map(|s| s.to_string())
            .collect();
        Self {
            catalog: catalog.clone(),
            step_order,
        }
    }

    pub fn with_selectable_items(
        mut self,
        authors: Vec<SelectionItem>,
        books: Vec<SelectionItem>,
    ) -> Self {
        if let Some(fields) = self.catalog.steps.get_mut("select_authors") {
            if let Some(field) = fields.first_mut() {
                field.items = Some(authors);
            }
        }
        if let Some(fields) = self.catalog.steps.get_mut("select_books") {
            if let Some(field) = fields.first_mut() {
                field.items = Some(books);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mandatory_step_cannot_be_disabled() {
        let mut flow = FlowConfig::bootstrap();
        let result = flow.merge_overrides(&serde_json::json!({
            "steps": {"select_authors": {"enabled": false}}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn optional_step_can_be_toggled() {
        let mut flow = FlowConfig::bootstrap();
        flow.merge_overrides(&serde_json::json!({
            "steps": {"covers_policy": {"enabled": false}}
        }))
        .unwrap();
        assert!(!flow.is_enabled("covers_policy"));
    }

    #[test]
    fn effective_model_drops_disabled_optional_steps() {
        let catalog = Catalog::bootstrap();
        let mut flow = FlowConfig::bootstrap();
        flow.merge_overrides(&serde_json::json!({
            "steps": {"id3_policy": {"enabled": false}}
        }))
        .unwrap();
        let model = EffectiveModel::project(&catalog, &flow);
        assert!(!model.step_order.contains(&"id3_policy".to_string()));
        assert!(model.step_order.contains(&"select_authors".to_string()));
    }
}
