//! Result rows returned by shard searches and the aggregator.

use crate::record::{Metadata, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record matched by a similarity query.
///
/// Hot rows report their full `content`; Warm rows report their summary.
/// `similarity` is cosine similarity, higher is closer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub owner_id: String,
    pub record_id: String,
    pub content_or_summary: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    pub similarity: f32,
    /// Tier that served this row.
    pub tier: Tier,
}

/// Sorts hits by descending similarity. Stable, so ties keep their input order.
pub(crate) fn sort_by_similarity(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
}
