//! Request and response data transfer objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tidemark_core::record::{Metadata, MetadataValue, Tier};
use tidemark_core::{config, SearchHit};

/// Convert JSON metadata from a request into core metadata.
///
/// Only booleans, numbers and strings are accepted; the offending key is
/// returned otherwise.
pub fn json_to_metadata(map: HashMap<String, serde_json::Value>) -> Result<Metadata, String> {
    map.into_iter()
        .map(|(k, v)| {
            let mv = match v {
                serde_json::Value::Bool(b) => MetadataValue::Boolean(b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => MetadataValue::Integer(i),
                    None => MetadataValue::Float(n.as_f64().unwrap_or(0.0)),
                },
                serde_json::Value::String(s) => MetadataValue::String(s),
                _ => return Err(k),
            };
            Ok((k, mv))
        })
        .collect()
}

/// Convert core metadata to JSON (for API responses).
pub fn metadata_to_json(map: &Metadata) -> BTreeMap<String, serde_json::Value> {
    map.iter()
        .map(|(k, v)| {
            let jv = match v {
                MetadataValue::Boolean(b) => serde_json::Value::Bool(*b),
                MetadataValue::Integer(i) => serde_json::json!(*i),
                MetadataValue::Float(f) => serde_json::json!(*f),
                MetadataValue::String(s) => serde_json::Value::String(s.clone()),
            };
            (k.clone(), jv)
        })
        .collect()
}

// --- Ingest ---

/// Request body for `POST /records`.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub owner_id: String,
    pub record_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    /// Defaults to the time of ingest.
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Response body for `POST /records`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub owner_id: String,
    pub record_id: String,
    pub shard_id: u32,
}

// --- Search ---

/// Request body for `POST /search`.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query_embedding: Vec<f32>,
    /// Restricts the query to one owner's shard.
    pub owner_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Per-shard time budget; the server default when absent.
    pub timeout_ms: Option<u64>,
}

fn default_limit() -> usize {
    config::DEFAULT_LIMIT
}
fn default_threshold() -> f32 {
    config::DEFAULT_SIMILARITY_THRESHOLD
}

/// One row of a search response.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResultResponse {
    pub owner_id: String,
    pub record_id: String,
    pub content_or_summary: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub similarity: f32,
    pub tier: Tier,
}

impl From<SearchHit> for SearchResultResponse {
    fn from(hit: SearchHit) -> Self {
        Self {
            metadata: metadata_to_json(&hit.metadata),
            owner_id: hit.owner_id,
            record_id: hit.record_id,
            content_or_summary: hit.content_or_summary,
            timestamp: hit.timestamp,
            similarity: hit.similarity,
            tier: hit.tier,
        }
    }
}

/// Response body for `POST /search`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultResponse>,
    pub shards_queried: usize,
    pub failed_shards: Vec<u32>,
    pub took_ms: u64,
}

// --- Admin ---

/// Request body for `POST /admin/migrate` and `POST /admin/archive`.
#[derive(Debug, Default, Deserialize)]
pub struct AgingRequest {
    /// Age threshold in days; the server's configured cutoff when absent.
    pub cutoff_days: Option<u32>,
}

// --- Health ---

/// Response body for `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub shard_count: u32,
    pub dimension: usize,
    pub opened_shards: usize,
    pub hot_records: usize,
    pub warm_records: usize,
}
