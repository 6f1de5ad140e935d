//! Two-pass discovery and preflight (component G, §4.G): a bounded fast
//! index over the inbox tree, followed by delta-driven deep enrichment
//! (cover candidates, book fingerprints) cached across runs.

pub mod enrichment;
pub mod fastindex;
pub mod types;

pub use enrichment::{book_ref, EnrichmentCache};
pub use fastindex::{fast_index, AuthorBookTuple, FastIndexResult};
pub use types::{
    BookFingerprint, Classification, DiscoveryItem, EnrichedBook, EnrichmentState, ItemKind, UnitType,
};
