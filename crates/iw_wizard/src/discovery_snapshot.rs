//! The session-scoped discovery snapshot: the fast-index result plus the
//! derived selectable author/book pools, frozen at `create_session` time
//! (§3 invariant 2 — `discovery.json` is immutable once written).

use crate::ids::{author_item_id, book_item_id, label};
use crate::model::SelectionItem;
use iw_canon::error::CoreError;
use iw_discovery::{fast_index, DiscoveryItem, UnitType};
use iw_fs::{Jail, RelativePath, Root};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookMeta {
    pub author: String,
    pub author_id: String,
    pub title: String,
    pub relative_path: String,
    pub unit_type: UnitType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySnapshot {
    pub root: String,
    pub items: Vec<DiscoveryItem>,
    pub authors: Vec<SelectionItem>,
    pub books: Vec<SelectionItem>,
    pub book_meta: BTreeMap<String, BookMeta>,
}

impl DiscoverySnapshot {
    pub fn build(jail: &Jail, root: Root, rel: &RelativePath) -> Result<(Self, String), CoreError> {
        let result = fast_index(jail, root, rel)?;
        let mut seen_authors = std::collections::BTreeSet::new();
        let mut authors = Vec::new();
        let mut books = Vec::new();
        let mut book_meta = BTreeMap::new();

        for tuple in &result.tuples {
            let author_key = if tuple.author.is_empty() { "Unknown" } else { &tuple.author };
            let author_id = author_item_id(author_key);
            if seen_authors.insert(author_key.to_string()) {
                authors.push(SelectionItem {
                    item_id: author_id.clone(),
                    label: label(author_key),
                });
            }
            let book_id = book_item_id(author_key, &tuple.book);
            books.push(SelectionItem {
                item_id: book_id.clone(),
                label: label(&tuple.book),
            });
            book_meta.insert(
                book_id,
                BookMeta {
                    author: author_key.to_string(),
                    author_id,
                    title: tuple.book.clone(),
                    relative_path: tuple.relative_path.clone(),
                    unit_type: tuple.unit_type,
                },
            );
        }

        Ok((
            Self {
                root: root.as_str().to_string(),
                items: result.items,
                authors,
                books,
                book_meta,
            },
            result.signature,
        ))
    }

    pub fn books_for_authors(&self, author_ids: &[String]) -> Vec<SelectionItem> {
        let wanted: std::collections::BTreeSet<&str> =
            author_ids.iter().map(|s| s.as_str()).collect();
        self.books
            .iter()
            .filter(|b| {
                self.book_meta
                    .get(&b.item_id)
                    .map(|m| wanted.contains(m.author_id.as_str()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}
