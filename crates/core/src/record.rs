//! Record types for the three storage tiers.
//!
//! A record is created in the Hot tier by ingest, rewritten into a
//! [`WarmRecord`] by the aging service, and finally reduced to a
//! [`ColdRecord`] inside an immutable columnar batch. A given
//! `(owner_id, record_id)` lives in exactly one tier except for the short
//! window between a migration's destination write and its source delete.

use crate::quantization::QuantizedVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A typed metadata value attached to a record.
///
/// Uses the default externally-tagged serde representation for bincode
/// compatibility. The server API layer converts to/from untagged JSON at the
/// HTTP boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    /// Boolean value (`true` / `false`).
    Boolean(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit floating-point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
}

/// Opaque key/value metadata. Ordered so that checksums over a record are stable.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Storage tier a search hit was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Warm,
}

/// Full-fidelity record held in the Hot tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotRecord {
    pub owner_id: String,
    /// Unique within the owning shard's store.
    pub record_id: String,
    pub content: String,
    /// Full-precision embedding of `content`.
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    /// Lowercase hex SHA-256 of `content`.
    pub content_hash: String,
}

impl HotRecord {
    /// Creates a record and computes its content hash.
    pub fn new(
        owner_id: impl Into<String>,
        record_id: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
        timestamp: DateTime<Utc>,
        metadata: Metadata,
    ) -> Self {
        let content = content.into();
        let content_hash = sha256_hex(content.as_bytes());
        Self {
            owner_id: owner_id.into(),
            record_id: record_id.into(),
            content,
            embedding,
            timestamp,
            metadata,
            content_hash,
        }
    }

    /// Rough in-memory footprint, used to report bytes freed by migration.
    pub fn estimated_bytes(&self) -> usize {
        self.owner_id.len()
            + self.record_id.len()
            + self.content.len()
            + self.embedding.len() * 4
            + self.content_hash.len()
            + metadata_bytes(&self.metadata)
            + 12
    }
}

/// Compressed record held in the Warm tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmRecord {
    pub owner_id: String,
    pub record_id: String,
    /// u8 scalar-quantized embedding.
    pub embedding: QuantizedVector,
    /// Short extractive summary of the original content.
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    /// `content_hash` of the Hot record this row was migrated from.
    pub source_hash: String,
    /// Hex SHA-256 over every other field; see [`WarmRecord::compute_checksum`].
    pub payload_checksum: String,
}

impl WarmRecord {
    /// Builds a warm row and seals it with its payload checksum.
    pub fn sealed(
        owner_id: String,
        record_id: String,
        embedding: QuantizedVector,
        summary: String,
        timestamp: DateTime<Utc>,
        metadata: Metadata,
        source_hash: String,
    ) -> crate::Result<Self> {
        let mut record = Self {
            owner_id,
            record_id,
            embedding,
            summary,
            timestamp,
            metadata,
            source_hash,
            payload_checksum: String::new(),
        };
        record.payload_checksum = record.compute_checksum()?;
        Ok(record)
    }

    /// Hex SHA-256 over the canonical bincode encoding of the migrated payload.
    pub fn compute_checksum(&self) -> crate::Result<String> {
        let canonical = bincode::serialize(&(
            &self.owner_id,
            &self.record_id,
            &self.embedding,
            &self.summary,
            &self.timestamp,
            &self.metadata,
            &self.source_hash,
        ))?;
        Ok(sha256_hex(&canonical))
    }

    pub fn estimated_bytes(&self) -> usize {
        self.owner_id.len()
            + self.record_id.len()
            + self.embedding.data.len()
            + 12
            + self.summary.len()
            + self.source_hash.len()
            + self.payload_checksum.len()
            + metadata_bytes(&self.metadata)
            + 12
    }
}

/// Archival record exported to object storage in columnar batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdRecord {
    pub owner_id: String,
    pub record_id: String,
    /// SHA-256 dedup digest.
    pub fingerprint: [u8; 32],
    /// One sentence.
    pub ultra_summary: String,
    pub timestamp: DateTime<Utc>,
    /// Daily rollup metrics for the owner on the record's UTC day.
    pub daily_metrics: BTreeMap<String, f64>,
}

/// Lowercase hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// True for 64-character lowercase hex strings (a SHA-256 digest).
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn metadata_bytes(metadata: &Metadata) -> usize {
    metadata
        .iter()
        .map(|(k, v)| {
            k.len()
                + match v {
                    MetadataValue::String(s) => s.len(),
                    _ => 8,
                }
        })
        .sum()
}
