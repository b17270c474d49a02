//! Background aging jobs.

use crate::breaker::{BreakerError, CircuitBreaker};
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tidemark_core::aging::cutoff_before;
use tidemark_core::storage::ColdExporter;
use tidemark_core::{AgingService, ArchiveStats, Error, MigrationStats, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Name of the breaker that guards Cold exports.
pub const OBJECT_STORE_BREAKER: &str = "object-store";

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(format!("blocking task failed: {e}")))
}

/// Runs one Hot → Warm migration on the blocking pool.
pub async fn run_migration(aging: Arc<AgingService>, cutoff_days: u32) -> Result<MigrationStats> {
    let stats = tokio::task::spawn_blocking(move || aging.migrate(cutoff_days))
        .await
        .map_err(join_error)??;
    counter!("tidemark_migrated_records_total").increment(stats.records_migrated as u64);
    counter!("tidemark_migration_errors_total").increment(stats.errors as u64);
    counter!("tidemark_migration_bytes_freed_total").increment(stats.bytes_freed);
    Ok(stats)
}

/// Migrates every `interval`. Returns `None` when `interval` is zero.
///
/// Each tick awaits its run before the next one starts, and late ticks are
/// skipped, so runs never overlap.
pub fn spawn_aging_job(
    aging: Arc<AgingService>,
    interval: Duration,
    cutoff_days: u32,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        tracing::info!("hot to warm aging job disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so startup is quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match run_migration(Arc::clone(&aging), cutoff_days).await {
                Ok(_) => {}
                Err(Error::MigrationInProgress) => {
                    tracing::info!("skipping scheduled migration, a run is in progress")
                }
                Err(e) => tracing::error!(error = %e, "scheduled migration failed"),
            }
        }
    }))
}

/// Exports aged Warm rows to Cold storage through a circuit breaker.
pub struct ColdArchiver {
    aging: Arc<AgingService>,
    exporter: Arc<ColdExporter>,
    breaker: Arc<CircuitBreaker>,
    running: tokio::sync::Mutex<()>,
}

impl ColdArchiver {
    pub fn new(
        aging: Arc<AgingService>,
        exporter: Arc<ColdExporter>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            aging,
            exporter,
            breaker,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn exporter(&self) -> &Arc<ColdExporter> {
        &self.exporter
    }

    /// Archives every Warm row older than `cutoff_days` days.
    ///
    /// Batches are exported one at a time. A failed export keeps its Warm
    /// rows; an open circuit ends the run and leaves the remaining batches
    /// for the next one.
    pub async fn run(&self, cutoff_days: u32) -> Result<ArchiveStats> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| Error::MigrationInProgress)?;

        let start_time = Utc::now();
        let cutoff = cutoff_before(start_time, cutoff_days);
        let mut stats = ArchiveStats {
            batches_exported: 0,
            records_archived: 0,
            errors: 0,
            start_time,
            end_time: start_time,
        };

        let aging = Arc::clone(&self.aging);
        let batches = tokio::task::spawn_blocking(move || aging.plan_cold_batches(cutoff))
            .await
            .map_err(join_error)??;

        for batch in batches {
            let exporter = Arc::clone(&self.exporter);
            let records = batch.records.clone();
            let partition = batch.partition_path.clone();
            let exported = self
                .breaker
                .call(|| async move {
                    tokio::task::spawn_blocking(move || exporter.export_batch(&records, &partition))
                        .await
                        .map_err(join_error)?
                })
                .await;

            match exported {
                Ok(receipt) => {
                    stats.batches_exported += 1;
                    let aging = Arc::clone(&self.aging);
                    let committed =
                        tokio::task::spawn_blocking(move || aging.commit_cold_batch(&batch))
                            .await
                            .map_err(join_error)
                            .and_then(|r| r);
                    match committed {
                        Ok(removed) => stats.records_archived += removed,
                        Err(e) => {
                            stats.errors += 1;
                            tracing::warn!(key = %receipt.key, error = %e, "failed to remove archived warm rows");
                        }
                    }
                }
                Err(BreakerError::Open { .. }) => {
                    stats.errors += 1;
                    tracing::warn!("object store circuit is open, stopping archive run");
                    break;
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
        counter!("tidemark_archived_records_total").increment(stats.records_archived as u64);
        counter!("tidemark_archived_batches_total").increment(stats.batches_exported as u64);
        counter!("tidemark_archive_errors_total").increment(stats.errors as u64);
        tracing::info!(
            batches = stats.batches_exported,
            archived = stats.records_archived,
            errors = stats.errors,
            "warm to cold archive finished"
        );
        Ok(stats)
    }
}

/// Archives every `interval`. Returns `None` when `interval` is zero.
pub fn spawn_archive_job(
    archiver: Arc<ColdArchiver>,
    interval: Duration,
    cutoff_days: u32,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        tracing::info!("warm to cold archive job disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match archiver.run(cutoff_days).await {
                Ok(_) => {}
                Err(Error::MigrationInProgress) => {
                    tracing::info!("skipping scheduled archive, a run is in progress")
                }
                Err(e) => tracing::error!(error = %e, "scheduled archive failed"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreakerConfig, CircuitState};
    use chrono::Duration as ChronoDuration;
    use std::path::Path;
    use tidemark_core::record::{HotRecord, Metadata};
    use tidemark_core::storage::{MemoryObjectStore, ObjectStore, ShardStores};
    use tidemark_core::{AgingConfig, ShardRouter};

    struct BrokenStore;

    impl ObjectStore for BrokenStore {
        fn put_file(&self, _key: &str, _source: &Path) -> Result<()> {
            Err(Error::Io(std::io::Error::other("bucket unreachable")))
        }
        fn get(&self, key: &str) -> Result<Vec<u8>> {
            Err(Error::ObjectNotFound(key.to_string()))
        }
        fn list_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn exists(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn old_record(owner: &str, id: &str, days: i64) -> HotRecord {
        HotRecord::new(
            owner,
            id,
            "An old note. With two sentences.",
            vec![0.5, 0.5],
            Utc::now() - ChronoDuration::days(days),
            Metadata::new(),
        )
    }

    /// Aging service whose Warm tier holds `owners.len()` rows aged 40 days.
    fn warm_fixture(owners: &[&str]) -> Arc<AgingService> {
        let stores = Arc::new(ShardStores::in_memory(ShardRouter::new(8).unwrap(), 2));
        for (i, owner) in owners.iter().enumerate() {
            stores.write(old_record(owner, &format!("r{i}"), 40)).unwrap();
        }
        let aging = Arc::new(AgingService::new(stores, AgingConfig::default()));
        let stats = aging.migrate(7).unwrap();
        assert_eq!(stats.records_migrated, owners.len());
        aging
    }

    fn exporter(store: Arc<dyn ObjectStore>, scratch: &Path) -> Arc<ColdExporter> {
        Arc::new(ColdExporter::new(store, "cold", scratch).unwrap())
    }

    #[tokio::test]
    async fn test_run_migration() {
        let stores = Arc::new(ShardStores::in_memory(ShardRouter::new(4).unwrap(), 2));
        stores.write(old_record("alice", "r1", 10)).unwrap();
        let aging = Arc::new(AgingService::new(stores.clone(), AgingConfig::default()));
        let stats = run_migration(aging, 7).await.unwrap();
        assert_eq!(stats.records_migrated, 1);
        let totals: (usize, usize) = stores
            .stats()
            .iter()
            .fold((0, 0), |acc, s| (acc.0 + s.hot_records, acc.1 + s.warm_records));
        assert_eq!(totals, (0, 1));
    }

    #[tokio::test]
    async fn test_archive_exports_and_removes_warm_rows() {
        let scratch = tempfile::tempdir().unwrap();
        let aging = warm_fixture(&["alice", "bob"]);
        let store = Arc::new(MemoryObjectStore::new());
        let archiver = ColdArchiver::new(
            aging.clone(),
            exporter(store.clone(), scratch.path()),
            Arc::new(CircuitBreaker::new(OBJECT_STORE_BREAKER, CircuitBreakerConfig::default())),
        );

        let stats = archiver.run(30).await.unwrap();
        assert_eq!(stats.records_archived, 2);
        assert_eq!(stats.errors, 0);
        assert_eq!(store.len(), stats.batches_exported);
        assert!(aging.stores().stats().iter().all(|s| s.warm_records == 0));

        let keys = archiver.exporter().list_batches(None).unwrap();
        let mut archived = 0;
        for key in keys {
            archived += archiver.exporter().read_batch(&key).unwrap().len();
        }
        assert_eq!(archived, 2);
    }

    #[tokio::test]
    async fn test_archive_with_huge_cutoff_archives_nothing() {
        let scratch = tempfile::tempdir().unwrap();
        let aging = warm_fixture(&["alice"]);
        let archiver = ColdArchiver::new(
            aging.clone(),
            exporter(Arc::new(MemoryObjectStore::new()), scratch.path()),
            Arc::new(CircuitBreaker::new(OBJECT_STORE_BREAKER, CircuitBreakerConfig::default())),
        );
        for days in [100_000_000, u32::MAX] {
            let stats = archiver.run(days).await.unwrap();
            assert_eq!(stats.batches_exported, 0);
            assert_eq!(stats.errors, 0);
        }
        assert_eq!(aging.stores().stats().iter().map(|s| s.warm_records).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_archive_respects_cutoff() {
        let scratch = tempfile::tempdir().unwrap();
        let aging = warm_fixture(&["alice"]);
        let archiver = ColdArchiver::new(
            aging.clone(),
            exporter(Arc::new(MemoryObjectStore::new()), scratch.path()),
            Arc::new(CircuitBreaker::new(OBJECT_STORE_BREAKER, CircuitBreakerConfig::default())),
        );
        let stats = archiver.run(60).await.unwrap();
        assert_eq!(stats.batches_exported, 0);
        assert_eq!(aging.stores().stats().iter().map(|s| s.warm_records).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_failed_exports_keep_rows_and_open_circuit() {
        let scratch = tempfile::tempdir().unwrap();
        // Owners spread over several shards so the run plans several batches.
        let owners = ["a1", "b2", "c3", "d4", "e5", "f6", "g7", "h8"];
        let aging = warm_fixture(&owners);
        let planned = aging
            .plan_cold_batches(Utc::now() - ChronoDuration::days(30))
            .unwrap()
            .len();
        assert!(planned >= 2);

        let breaker = Arc::new(CircuitBreaker::new(
            OBJECT_STORE_BREAKER,
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        ));
        let archiver = ColdArchiver::new(
            aging.clone(),
            exporter(Arc::new(BrokenStore), scratch.path()),
            breaker.clone(),
        );

        let stats = archiver.run(30).await.unwrap();
        assert_eq!(stats.batches_exported, 0);
        assert_eq!(stats.records_archived, 0);
        // First export fails and trips the breaker; the next batch is rejected.
        assert_eq!(stats.errors, 2);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            aging.stores().stats().iter().map(|s| s.warm_records).sum::<usize>(),
            owners.len()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_jobs() {
        let stores = Arc::new(ShardStores::in_memory(ShardRouter::new(2).unwrap(), 2));
        let aging = Arc::new(AgingService::new(stores, AgingConfig::default()));
        assert!(spawn_aging_job(aging, Duration::ZERO, 7).is_none());
    }

    #[tokio::test]
    async fn test_aging_job_migrates_on_tick() {
        let stores = Arc::new(ShardStores::in_memory(ShardRouter::new(2).unwrap(), 2));
        stores.write(old_record("alice", "r1", 10)).unwrap();
        let aging = Arc::new(AgingService::new(stores.clone(), AgingConfig::default()));

        let handle = spawn_aging_job(aging, Duration::from_millis(20), 7).unwrap();
        for _ in 0..200 {
            if stores.stats().iter().all(|s| s.hot_records == 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(stores.stats().iter().all(|s| s.hot_records == 0));
        assert_eq!(stores.stats().iter().map(|s| s.warm_records).sum::<usize>(), 1);
    }
}
