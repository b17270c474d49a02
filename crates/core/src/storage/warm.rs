//! Warm tier: summarized records with u8-quantized embeddings.
//!
//! Rows are only ever produced by migration, and a migration that is retried
//! after a partial failure must not fail on rows it already wrote, so writes
//! here are upserts.

use crate::error::{Error, Result};
use crate::quantization::cosine_asym;
use crate::record::{Tier, WarmRecord};
use crate::routing::ShardRouter;
use crate::search::types::{sort_by_similarity, SearchHit};
use crate::storage::table::{TierRow, TierTable};
use chrono::{DateTime, Utc};
use std::path::Path;

impl TierRow for WarmRecord {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
    fn record_id(&self) -> &str {
        &self.record_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Whether an upsert created a row or overwrote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

#[derive(Debug)]
pub struct WarmStore {
    table: TierTable<WarmRecord>,
    dimension: usize,
}

impl WarmStore {
    pub fn in_memory(shard_id: u32, router: ShardRouter, dimension: usize) -> Self {
        Self {
            table: TierTable::in_memory("warm", shard_id, router),
            dimension,
        }
    }

    pub fn open(
        shard_id: u32,
        router: ShardRouter,
        dimension: usize,
        base_dir: &Path,
    ) -> Result<Self> {
        Ok(Self {
            table: TierTable::open("warm", shard_id, router, base_dir)?,
            dimension,
        })
    }

    /// Inserts or replaces a row. The row's payload checksum must verify.
    pub fn upsert(&self, record: WarmRecord) -> Result<UpsertOutcome> {
        if record.embedding.dim() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: record.embedding.dim(),
            });
        }
        if record.compute_checksum()? != record.payload_checksum {
            return Err(Error::Integrity(format!(
                "payload checksum mismatch for '{}/{}'",
                record.owner_id, record.record_id
            )));
        }
        Ok(match self.table.insert(record, true)? {
            Some(_) => UpsertOutcome::Replaced,
            None => UpsertOutcome::Inserted,
        })
    }

    pub fn get(&self, owner_id: &str, record_id: &str) -> Result<Option<WarmRecord>> {
        self.table.get(owner_id, record_id)
    }

    pub fn delete(&self, owner_id: &str, record_id: &str) -> Result<bool> {
        Ok(self.table.remove(owner_id, record_id)?.is_some())
    }

    /// Asymmetric cosine search: full-precision query against quantized rows.
    /// Hits carry the summary as their text.
    pub fn search_similar(
        &self,
        query: &[f32],
        owner_id: Option<&str>,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut hits = self.table.filter_map(owner_id, |r| {
            let similarity = cosine_asym(query, r.embedding.as_ref());
            (similarity >= threshold).then(|| SearchHit {
                owner_id: r.owner_id.clone(),
                record_id: r.record_id.clone(),
                content_or_summary: r.summary.clone(),
                timestamp: r.timestamp,
                metadata: r.metadata.clone(),
                similarity,
                tier: Tier::Warm,
            })
        })?;
        sort_by_similarity(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<WarmRecord>> {
        self.table.older_than(cutoff)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn owners(&self) -> Vec<String> {
        self.table.owners()
    }

    pub fn close(&self) {
        self.table.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::QuantizedVector;
    use crate::record::{sha256_hex, Metadata};

    fn warm(owner: &str, id: &str, embedding: &[f32], summary: &str) -> WarmRecord {
        WarmRecord::sealed(
            owner.into(),
            id.into(),
            QuantizedVector::quantize(embedding),
            summary.into(),
            Utc::now(),
            Metadata::new(),
            sha256_hex(summary.as_bytes()),
        )
        .unwrap()
    }

    fn store() -> WarmStore {
        WarmStore::in_memory(0, ShardRouter::new(1).unwrap(), 3)
    }

    #[test]
    fn test_upsert_inserts_then_replaces() {
        let s = store();
        let first = warm("alice", "r1", &[0.1, 0.5, 0.9], "first");
        assert_eq!(s.upsert(first).unwrap(), UpsertOutcome::Inserted);
        let second = warm("alice", "r1", &[0.1, 0.5, 0.9], "second");
        assert_eq!(s.upsert(second).unwrap(), UpsertOutcome::Replaced);
        assert_eq!(s.len(), 1);
        assert_eq!(s.get("alice", "r1").unwrap().unwrap().summary, "second");
    }

    #[test]
    fn test_upsert_rejects_bad_checksum() {
        let s = store();
        let mut row = warm("alice", "r1", &[0.1, 0.5, 0.9], "summary");
        row.summary = "changed after sealing".into();
        assert!(matches!(s.upsert(row).unwrap_err(), Error::Integrity(_)));
        assert!(s.is_empty());
    }

    #[test]
    fn test_upsert_rejects_wrong_dimension() {
        let s = store();
        let row = warm("alice", "r1", &[0.1, 0.5], "summary");
        assert!(matches!(
            s.upsert(row).unwrap_err(),
            Error::DimensionMismatch { expected: 3, got: 2 }
        ));
    }

    #[test]
    fn test_search_returns_summaries() {
        let s = store();
        s.upsert(warm("alice", "near", &[1.0, 0.1, 0.0], "near summary")).unwrap();
        s.upsert(warm("alice", "far", &[0.0, 0.1, 1.0], "far summary")).unwrap();
        let hits = s.search_similar(&[1.0, 0.0, 0.0], None, 5, 0.5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, "near");
        assert_eq!(hits[0].content_or_summary, "near summary");
        assert_eq!(hits[0].tier, Tier::Warm);
    }

    #[test]
    fn test_delete() {
        let s = store();
        s.upsert(warm("alice", "r1", &[0.1, 0.5, 0.9], "x")).unwrap();
        assert!(s.delete("alice", "r1").unwrap());
        assert!(!s.delete("alice", "r1").unwrap());
    }
}
