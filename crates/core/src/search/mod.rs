//! Search primitives: result rows and cross-shard aggregation.

/// Merge, deduplicate, and rank per-shard result sets.
pub mod aggregate;
/// The `SearchHit` result row.
pub mod types;

pub use aggregate::merge;
pub use types::SearchHit;
