//! `Plan` / `BookDecision` (§3, §4.H `compute_plan`).

use crate::model::SelectionItem;
use iw_discovery::UnitType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionUnitType {
    Dir,
    File,
}

impl From<UnitType> for DecisionUnitType {
    fn from(u: UnitType) -> Self {
        match u {
            UnitType::Dir => DecisionUnitType::Dir,
            UnitType::File => DecisionUnitType::File,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookDecision {
    pub book_id: String,
    pub book_rel_path: String,
    pub unit_type: DecisionUnitType,
    pub author: String,
    pub title: String,
    pub handling_mode: String,
    /// src -> dst, only populated when a rename is implied by policy.
    pub rename_preview: BTreeMap<String, String>,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedBookSummary {
    pub label: String,
    pub book_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub selected_books: Vec<SelectedBookSummary>,
}

/// Computed-only, persisted to `wizards:import/sessions/<sid>/plan.json`
/// (§4.H). Totally ordered by `(label, book_id)` per §8 property 9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub books: Vec<BookDecision>,
    pub summary: PlanSummary,
}

impl Plan {
    pub fn from_books(mut books: Vec<BookDecision>, labels: &BTreeMap<String, String>) -> Self {
        books.sort_by(|a, b| {
            let la = labels.get(&a.book_id).cloned().unwrap_or_default();
            let lb = labels.get(&b.book_id).cloned().unwrap_or_default();
            la.cmp(&lb).then_with(|| a.book_id.cmp(&b.book_id))
        });
        let selected_books = books
            .iter()
            .map(|b| SelectedBookSummary {
                label: labels.get(&b.book_id).cloned().unwrap_or_default(),
                book_id: b.book_id.clone(),
            })
            .collect();
        Self {
            books,
            summary: PlanSummary { selected_books },
        }
    }
}

/// Selectable author/book lists presented to the wizard engine's
/// `select_authors`/`select_books` steps, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct SelectablePools {
    pub authors: Vec<SelectionItem>,
    pub books: Vec<SelectionItem>,
    /// `book item_id -> (author, rel_path, unit_type)`, for plan assembly.
    pub book_meta: BTreeMap<String, (String, String, UnitType)>,
}
