//! Hot tier: full-fidelity recent records with exact similarity search.

use crate::config;
use crate::error::{Error, Result};
use crate::quantization::cosine_f32;
use crate::record::{sha256_hex, HotRecord, Metadata, MetadataValue, Tier};
use crate::routing::ShardRouter;
use crate::search::types::{sort_by_similarity, SearchHit};
use crate::storage::table::{TierRow, TierTable};
use chrono::{DateTime, Utc};
use std::path::Path;

impl TierRow for HotRecord {
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

/// One shard's Hot store.
#[derive(Debug)]
pub struct HotStore {
    table: TierTable<HotRecord>,
    dimension: usize,
}

impl HotStore {
    pub fn in_memory(shard_id: u32, router: ShardRouter, dimension: usize) -> Self {
        Self {
            table: TierTable::in_memory("hot", shard_id, router),
            dimension,
        }
    }

    /// Opens the store for `shard_id` under `base_dir`, loading existing partitions.
    pub fn open(
        shard_id: u32,
        router: ShardRouter,
        dimension: usize,
        base_dir: &Path,
    ) -> Result<Self> {
        Ok(Self {
            table: TierTable::open("hot", shard_id, router, base_dir)?,
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Writes a new record. An existing `(owner_id, record_id)` is rejected.
    pub fn write(&self, record: HotRecord) -> Result<()> {
        validate_record(&record, self.dimension)?;
        self.table.insert(record, false)?;
        Ok(())
    }

    pub fn get(&self, owner_id: &str, record_id: &str) -> Result<Option<HotRecord>> {
        self.table.get(owner_id, record_id)
    }

    /// Deletes a record. Returns `true` if it existed.
    pub fn delete(&self, owner_id: &str, record_id: &str) -> Result<bool> {
        Ok(self.table.remove(owner_id, record_id)?.is_some())
    }

    /// Exact cosine search over this shard's rows.
    ///
    /// Keeps rows with `similarity >= threshold`, highest first, at most `limit`.
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
            let similarity = cosine_f32(query, &r.embedding);
            (similarity >= threshold).then(|| SearchHit {
                owner_id: r.owner_id.clone(),
                record_id: r.record_id.clone(),
                content_or_summary: r.content.clone(),
                timestamp: r.timestamp,
                metadata: r.metadata.clone(),
                similarity,
                tier: Tier::Hot,
            })
        })?;
        sort_by_similarity(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Records with `timestamp < cutoff`, oldest first.
    pub fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<HotRecord>> {
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

    pub fn is_open(&self) -> bool {
        self.table.is_open()
    }
}

/// Ingest-side validation of a Hot record.
pub fn validate_record(record: &HotRecord, dimension: usize) -> Result<()> {
    if record.record_id.is_empty() || record.record_id.chars().count() > config::MAX_RECORD_ID_LEN
    {
        return Err(Error::InvalidRecord(format!(
            "record id must be 1..={} characters",
            config::MAX_RECORD_ID_LEN
        )));
    }
    if record.content.len() > config::MAX_CONTENT_LEN {
        return Err(Error::InvalidRecord(format!(
            "content exceeds {} bytes",
            config::MAX_CONTENT_LEN
        )));
    }
    if record.embedding.len() != dimension {
        return Err(Error::DimensionMismatch {
            expected: dimension,
            got: record.embedding.len(),
        });
    }
    if record.embedding.iter().any(|v| !v.is_finite()) {
        return Err(Error::InvalidRecord(
            "embedding contains NaN or infinite values".into(),
        ));
    }
    if record.content_hash != sha256_hex(record.content.as_bytes()) {
        return Err(Error::InvalidRecord(
            "content_hash does not match content".into(),
        ));
    }
    validate_metadata(&record.metadata)
}

fn validate_metadata(metadata: &Metadata) -> Result<()> {
    if metadata.len() > config::MAX_METADATA_KEYS {
        return Err(Error::InvalidRecord(format!(
            "metadata has more than {} keys",
            config::MAX_METADATA_KEYS
        )));
    }
    let bytes: usize = metadata
        .iter()
        .map(|(k, v)| {
            k.len()
                + match v {
                    MetadataValue::String(s) => s.len(),
                    _ => 8,
                }
        })
        .sum();
    if bytes > config::MAX_METADATA_BYTES {
        return Err(Error::InvalidRecord(format!(
            "metadata exceeds {} bytes",
            config::MAX_METADATA_BYTES
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const DIM: usize = 4;

    fn store() -> HotStore {
        HotStore::in_memory(0, ShardRouter::new(1).unwrap(), DIM)
    }

    fn record(owner: &str, id: &str, embedding: [f32; DIM], age_days: i64) -> HotRecord {
        HotRecord::new(
            owner,
            id,
            format!("content for {id}."),
            embedding.to_vec(),
            Utc::now() - Duration::days(age_days),
            Metadata::new(),
        )
    }

    #[test]
    fn test_write_and_get() {
        let s = store();
        s.write(record("alice", "r1", [1.0, 0.0, 0.0, 0.0], 0)).unwrap();
        let r = s.get("alice", "r1").unwrap().unwrap();
        assert_eq!(r.content, "content for r1.");
        assert!(s.get("alice", "missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_write_rejected() {
        let s = store();
        s.write(record("alice", "r1", [1.0, 0.0, 0.0, 0.0], 0)).unwrap();
        let err = s.write(record("alice", "r1", [0.0, 1.0, 0.0, 0.0], 0)).unwrap_err();
        assert!(matches!(err, Error::DuplicateRecord { .. }));
    }

    #[test]
    fn test_write_validation() {
        let s = store();
        let err = s.write(record("alice", "", [1.0, 0.0, 0.0, 0.0], 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)));

        let mut wrong_dim = record("alice", "r", [1.0, 0.0, 0.0, 0.0], 0);
        wrong_dim.embedding.push(1.0);
        assert!(matches!(
            s.write(wrong_dim).unwrap_err(),
            Error::DimensionMismatch { expected: 4, got: 5 }
        ));

        let nan = record("alice", "r", [f32::NAN, 0.0, 0.0, 0.0], 0);
        assert!(matches!(s.write(nan).unwrap_err(), Error::InvalidRecord(_)));

        let mut tampered = record("alice", "r", [1.0, 0.0, 0.0, 0.0], 0);
        tampered.content.push('x');
        assert!(matches!(s.write(tampered).unwrap_err(), Error::InvalidRecord(_)));

        let bad_owner = record("../etc", "r", [1.0, 0.0, 0.0, 0.0], 0);
        assert!(matches!(s.write(bad_owner).unwrap_err(), Error::InvalidOwnerId(_)));
        assert!(s.is_empty());
    }

    #[test]
    fn test_search_similar_orders_and_thresholds() {
        let s = store();
        s.write(record("alice", "exact", [1.0, 0.0, 0.0, 0.0], 0)).unwrap();
        s.write(record("alice", "close", [0.9, 0.1, 0.0, 0.0], 0)).unwrap();
        s.write(record("bob", "far", [0.0, 0.0, 1.0, 0.0], 0)).unwrap();

        let hits = s.search_similar(&[1.0, 0.0, 0.0, 0.0], None, 10, 0.5).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record_id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "close"]);
        assert!(hits.iter().all(|h| h.tier == Tier::Hot));
        assert!(hits[0].similarity >= hits[1].similarity);

        let limited = s.search_similar(&[1.0, 0.0, 0.0, 0.0], None, 1, 0.0).unwrap();
        assert_eq!(limited.len(), 1);
        assert!(s.search_similar(&[1.0, 0.0, 0.0, 0.0], None, 0, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_search_similar_owner_filter() {
        let s = store();
        s.write(record("alice", "a", [1.0, 0.0, 0.0, 0.0], 0)).unwrap();
        s.write(record("bob", "b", [1.0, 0.0, 0.0, 0.0], 0)).unwrap();
        let hits = s.search_similar(&[1.0, 0.0, 0.0, 0.0], Some("bob"), 10, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].owner_id, "bob");
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let s = store();
        assert!(s.search_similar(&[1.0, 0.0], None, 5, 0.0).is_err());
    }

    #[test]
    fn test_older_than_and_delete() {
        let s = store();
        s.write(record("alice", "old", [1.0, 0.0, 0.0, 0.0], 10)).unwrap();
        s.write(record("alice", "new", [1.0, 0.0, 0.0, 0.0], 0)).unwrap();
        let old = s.older_than(Utc::now() - Duration::days(7)).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].record_id, "old");

        assert!(s.delete("alice", "old").unwrap());
        assert!(!s.delete("alice", "old").unwrap());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_closed_store_not_initialized() {
        let s = store();
        s.close();
        let err = s.write(record("alice", "r", [1.0, 0.0, 0.0, 0.0], 0)).unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
    }
}
