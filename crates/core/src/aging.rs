//! Tier aging: Hot → Warm migration and Warm → Cold archival.
//!
//! Migration is best-effort and resumable. Each record is handled on its
//! own: a record that fails stays in its source tier, is counted, and is
//! retried by the next run. The Warm write, its read-back verification and
//! the Hot delete are not one transaction, so a crash in between leaves the
//! record in both tiers; the next run re-migrates it and the Warm upsert
//! makes that harmless. Ingest waits while a record of its shard is moved and
//! refuses ids already in Warm, so only a crash can leave such a row.

use crate::config;
use crate::error::{Error, Result};
use crate::quantization::QuantizedVector;
use crate::record::{is_sha256_hex, ColdRecord, HotRecord, WarmRecord};
use crate::storage::cold::{fingerprint_for, ultra_summary, ColdExporter};
use crate::storage::shards::{ShardStores, ShardTier};
use crate::summarize::summarize;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgingConfig {
    /// Character budget of Warm summaries.
    pub summary_max_chars: usize,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: config::DEFAULT_SUMMARY_MAX_CHARS,
        }
    }
}

/// Outcome of one Hot → Warm run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStats {
    pub records_migrated: usize,
    /// Estimated Hot bytes released minus the Warm bytes written.
    pub bytes_freed: u64,
    pub errors: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Warm rows of one shard and one UTC day, ready for export.
#[derive(Debug, Clone, PartialEq)]
pub struct ColdBatch {
    pub shard_id: u32,
    /// `date=YYYY-MM-DD`
    pub partition_path: String,
    pub records: Vec<ColdRecord>,
}

/// Outcome of one Warm → Cold run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveStats {
    pub batches_exported: usize,
    pub records_archived: usize,
    pub errors: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// The instant `days` days before `now`.
///
/// Clamps to the earliest representable time, where nothing is older than
/// the cutoff, instead of overflowing.
pub fn cutoff_before(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now.checked_sub_signed(Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Moves aged records down the tiers of every opened shard.
#[derive(Debug)]
pub struct AgingService {
    stores: Arc<ShardStores>,
    config: AgingConfig,
    running: Mutex<()>,
}

impl AgingService {
    pub fn new(stores: Arc<ShardStores>, config: AgingConfig) -> Self {
        Self {
            stores,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn stores(&self) -> &Arc<ShardStores> {
        &self.stores
    }

    /// Migrates every Hot record older than `cutoff_days` days to Warm.
    pub fn migrate(&self, cutoff_days: u32) -> Result<MigrationStats> {
        self.migrate_before(cutoff_before(Utc::now(), cutoff_days))
    }

    /// Migrates every Hot record with `timestamp < cutoff` to Warm.
    ///
    /// Fails only with `MigrationInProgress`; per-record failures are
    /// counted in `errors`.
    pub fn migrate_before(&self, cutoff: DateTime<Utc>) -> Result<MigrationStats> {
        let _guard = self.running.try_lock().ok_or(Error::MigrationInProgress)?;
        let start_time = Utc::now();
        let mut records_migrated = 0;
        let mut bytes_freed = 0u64;
        let mut errors = 0;

        for tier in self.stores.opened() {
            let candidates = match tier.hot.older_than(cutoff) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(shard_id = tier.shard_id, error = %e, "skipping shard during migration");
                    errors += 1;
                    continue;
                }
            };
            for record in candidates {
                let owner_id = record.owner_id.clone();
                let record_id = record.record_id.clone();
                match self.migrate_record(&tier, record) {
                    Ok(freed) => {
                        records_migrated += 1;
                        bytes_freed += freed;
                    }
                    Err(e) => {
                        errors += 1;
                        tracing::warn!(
                            shard_id = tier.shard_id,
                            owner_id = %owner_id,
                            record_id = %record_id,
                            error = %e,
                            "record migration failed, leaving it in hot tier"
                        );
                    }
                }
            }
        }

        let stats = MigrationStats {
            records_migrated,
            bytes_freed,
            errors,
            start_time,
            end_time: Utc::now(),
        };
        tracing::info!(
            migrated = stats.records_migrated,
            bytes_freed = stats.bytes_freed,
            errors = stats.errors,
            cutoff = %cutoff,
            "hot to warm migration finished"
        );
        Ok(stats)
    }

    fn migrate_record(&self, tier: &ShardTier, record: HotRecord) -> Result<u64> {
        let summary = summarize(&record.content, self.config.summary_max_chars)?;
        let embedding = QuantizedVector::quantize(&record.embedding);
        let hot_bytes = record.estimated_bytes();
        let source_hash = record.content_hash.clone();

        let warm = WarmRecord::sealed(
            record.owner_id.clone(),
            record.record_id.clone(),
            embedding,
            summary,
            record.timestamp,
            record.metadata,
            record.content_hash,
        )?;
        let warm_bytes = warm.estimated_bytes();
        let _moving = tier.lock_tier_move();
        tier.warm.upsert(warm)?;

        let stored = tier
            .warm
            .get(&record.owner_id, &record.record_id)?
            .ok_or_else(|| Error::Integrity("warm row missing after write".into()))?;
        if !is_sha256_hex(&stored.payload_checksum)
            || stored.compute_checksum()? != stored.payload_checksum
            || stored.source_hash != source_hash
        {
            return Err(Error::Integrity(format!(
                "warm row '{}/{}' failed read-back verification",
                record.owner_id, record.record_id
            )));
        }

        tier.hot.delete(&record.owner_id, &record.record_id)?;
        Ok(hot_bytes.saturating_sub(warm_bytes) as u64)
    }

    /// Groups Warm rows older than `cutoff` into one batch per shard per UTC day.
    ///
    /// Each row's `daily_metrics` is its owner's rollup for that day:
    /// `records`, `avg_summary_chars`, `min_timestamp_ms`, `max_timestamp_ms`.
    pub fn plan_cold_batches(&self, cutoff: DateTime<Utc>) -> Result<Vec<ColdBatch>> {
        let mut batches = Vec::new();
        for tier in self.stores.opened() {
            let mut by_day: BTreeMap<NaiveDate, Vec<WarmRecord>> = BTreeMap::new();
            for row in tier.warm.older_than(cutoff)? {
                by_day.entry(row.timestamp.date_naive()).or_default().push(row);
            }
            for (day, rows) in by_day {
                let rollups = owner_rollups(&rows);
                let records = rows
                    .iter()
                    .map(|r| ColdRecord {
                        owner_id: r.owner_id.clone(),
                        record_id: r.record_id.clone(),
                        fingerprint: fingerprint_for(&r.owner_id, &r.record_id, &r.summary),
                        ultra_summary: ultra_summary(&r.summary),
                        timestamp: r.timestamp,
                        daily_metrics: rollups.get(&r.owner_id).cloned().unwrap_or_default(),
                    })
                    .collect();
                batches.push(ColdBatch {
                    shard_id: tier.shard_id,
                    partition_path: format!("date={}", day.format("%Y-%m-%d")),
                    records,
                });
            }
        }
        Ok(batches)
    }

    /// Deletes the Warm rows of an exported batch. Returns how many were removed.
    pub fn commit_cold_batch(&self, batch: &ColdBatch) -> Result<usize> {
        let tier = self.stores.get(batch.shard_id).ok_or_else(|| {
            Error::NotInitialized(format!("shard {} is not open", batch.shard_id))
        })?;
        let mut removed = 0;
        for record in &batch.records {
            if tier.warm.delete(&record.owner_id, &record.record_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Exports and removes every Warm row older than `cutoff_days` days.
    ///
    /// A batch whose export fails keeps its Warm rows for the next run.
    pub fn archive(&self, cutoff_days: u32, exporter: &ColdExporter) -> Result<ArchiveStats> {
        let _guard = self.running.try_lock().ok_or(Error::MigrationInProgress)?;
        let start_time = Utc::now();
        let cutoff = cutoff_before(start_time, cutoff_days);
        let mut stats = ArchiveStats {
            batches_exported: 0,
            records_archived: 0,
            errors: 0,
            start_time,
            end_time: start_time,
        };

        for batch in self.plan_cold_batches(cutoff)? {
            match exporter.export_batch(&batch.records, &batch.partition_path) {
                Ok(receipt) => {
                    stats.batches_exported += 1;
                    match self.commit_cold_batch(&batch) {
                        Ok(removed) => stats.records_archived += removed,
                        Err(e) => {
                            stats.errors += 1;
                            tracing::warn!(key = %receipt.key, error = %e, "failed to remove archived warm rows");
                        }
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(
                        shard_id = batch.shard_id,
                        partition = %batch.partition_path,
                        error = %e,
                        "cold export failed, keeping warm rows"
                    );
                }
            }
        }

        stats.end_time = Utc::now();
        tracing::info!(
            batches = stats.batches_exported,
            archived = stats.records_archived,
            errors = stats.errors,
            "warm to cold archive finished"
        );
        Ok(stats)
    }
}

fn owner_rollups(rows: &[WarmRecord]) -> HashMap<String, BTreeMap<String, f64>> {
    struct Acc {
        count: usize,
        summary_chars: usize,
        min_ms: i64,
        max_ms: i64,
    }

    let mut accs: HashMap<&str, Acc> = HashMap::new();
    for r in rows {
        let ms = r.timestamp.timestamp_millis();
        let acc = accs.entry(r.owner_id.as_str()).or_insert(Acc {
            count: 0,
            summary_chars: 0,
            min_ms: ms,
            max_ms: ms,
        });
        acc.count += 1;
        acc.summary_chars += r.summary.chars().count();
        acc.min_ms = acc.min_ms.min(ms);
        acc.max_ms = acc.max_ms.max(ms);
    }

    accs.into_iter()
        .map(|(owner, acc)| {
            let mut m = BTreeMap::new();
            m.insert("records".to_string(), acc.count as f64);
            m.insert(
                "avg_summary_chars".to_string(),
                acc.summary_chars as f64 / acc.count as f64,
            );
            m.insert("min_timestamp_ms".to_string(), acc.min_ms as f64);
            m.insert("max_timestamp_ms".to_string(), acc.max_ms as f64);
            (owner.to_string(), m)
        })
        .collect()
}
