//! Registry of opened per-shard stores.

use crate::error::{Error, Result};
use crate::record::HotRecord;
use crate::routing::{validate_owner_id, ShardRouter};
use crate::storage::hot::HotStore;
use crate::storage::warm::WarmStore;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The Hot and Warm stores of one shard.
#[derive(Debug)]
pub struct ShardTier {
    pub shard_id: u32,
    pub hot: HotStore,
    pub warm: WarmStore,
    /// Serializes ingest against migration moving a record between tiers.
    tier_move: Mutex<()>,
}

impl ShardTier {
    /// Writes a new record to Hot. Fails with `DuplicateRecord` if the id
    /// is already held by either tier.
    pub fn ingest(&self, record: HotRecord) -> Result<()> {
        let _moving = self.tier_move.lock();
        if self.warm.get(&record.owner_id, &record.record_id)?.is_some() {
            return Err(Error::DuplicateRecord {
                owner_id: record.owner_id,
                record_id: record.record_id,
            });
        }
        self.hot.write(record)
    }

    /// Held while a record is copied to Warm and removed from Hot.
    pub(crate) fn lock_tier_move(&self) -> MutexGuard<'_, ()> {
        self.tier_move.lock()
    }
}

/// Record counts for one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub shard_id: u32,
    pub hot_records: usize,
    pub warm_records: usize,
}

/// Lazily opened shard stores, keyed by shard id.
///
/// Memory-only when no directories are configured; otherwise Hot and Warm
/// partitions live under `hot_dir` and `warm_dir`.
#[derive(Debug)]
pub struct ShardStores {
    router: ShardRouter,
    dimension: usize,
    hot_dir: Option<PathBuf>,
    warm_dir: Option<PathBuf>,
    shards: RwLock<HashMap<u32, Arc<ShardTier>>>,
}

impl ShardStores {
    pub fn in_memory(router: ShardRouter, dimension: usize) -> Self {
        Self {
            router,
            dimension,
            hot_dir: None,
            warm_dir: None,
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Stores backed by `data_dir/hot` and `data_dir/warm`.
    pub fn persistent(router: ShardRouter, dimension: usize, data_dir: &Path) -> Self {
        Self {
            router,
            dimension,
            hot_dir: Some(data_dir.join("hot")),
            warm_dir: Some(data_dir.join("warm")),
            shards: RwLock::new(HashMap::new()),
        }
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Returns the stores for `shard_id`, opening them on first use.
    pub fn get_or_open(&self, shard_id: u32) -> Result<Arc<ShardTier>> {
        if let Some(tier) = self.shards.read().get(&shard_id) {
            return Ok(Arc::clone(tier));
        }

        let mut shards = self.shards.write();
        if let Some(tier) = shards.get(&shard_id) {
            return Ok(Arc::clone(tier));
        }
        let tier = Arc::new(self.open_tier(shard_id)?);
        shards.insert(shard_id, Arc::clone(&tier));
        tracing::debug!(shard_id, "opened shard stores");
        Ok(tier)
    }

    fn open_tier(&self, shard_id: u32) -> Result<ShardTier> {
        if shard_id >= self.router.shard_count() {
            return Err(Error::InvalidConfig(format!(
                "shard {} out of range 0..{}",
                shard_id,
                self.router.shard_count()
            )));
        }
        let hot = match &self.hot_dir {
            Some(dir) => HotStore::open(shard_id, self.router, self.dimension, dir)?,
            None => HotStore::in_memory(shard_id, self.router, self.dimension),
        };
        let warm = match &self.warm_dir {
            Some(dir) => WarmStore::open(shard_id, self.router, self.dimension, dir)?,
            None => WarmStore::in_memory(shard_id, self.router, self.dimension),
        };
        Ok(ShardTier {
            shard_id,
            hot,
            warm,
            tier_move: Mutex::new(()),
        })
    }

    /// Stores for `shard_id` if already opened. Never creates stores.
    pub fn get(&self, shard_id: u32) -> Option<Arc<ShardTier>> {
        self.shards.read().get(&shard_id).cloned()
    }

    /// Opens every shard that has a directory on disk. Returns how many were opened.
    pub fn open_existing(&self) -> Result<usize> {
        let mut ids = BTreeSet::new();
        for dir in [&self.hot_dir, &self.warm_dir].into_iter().flatten() {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name();
                let Some(id) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix("shard_"))
                    .and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                if id < self.router.shard_count() {
                    ids.insert(id);
                } else {
                    tracing::warn!(shard_id = id, "ignoring shard directory beyond shard_count");
                }
            }
        }
        for &id in &ids {
            self.get_or_open(id)?;
        }
        if !ids.is_empty() {
            tracing::info!(shards = ids.len(), "opened existing shard stores");
        }
        Ok(ids.len())
    }

    /// Ingest: routes the record by owner and writes it to that shard's Hot store.
    ///
    /// A record already migrated to Warm is a duplicate too.
    pub fn write(&self, record: HotRecord) -> Result<u32> {
        validate_owner_id(&record.owner_id)?;
        let shard_id = self.router.shard_for(&record.owner_id);
        self.get_or_open(shard_id)?.ingest(record)?;
        Ok(shard_id)
    }

    /// Opened shards, sorted.
    pub fn shard_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.shards.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Opened shard stores, sorted by id.
    pub fn opened(&self) -> Vec<Arc<ShardTier>> {
        let mut tiers: Vec<Arc<ShardTier>> = self.shards.read().values().cloned().collect();
        tiers.sort_by_key(|t| t.shard_id);
        tiers
    }

    pub fn stats(&self) -> Vec<ShardStats> {
        self.opened()
            .iter()
            .map(|t| ShardStats {
                shard_id: t.shard_id,
                hot_records: t.hot.len(),
                warm_records: t.warm.len(),
            })
            .collect()
    }

    /// Closes every opened store. Later operations on them fail with `NotInitialized`.
    pub fn close_all(&self) {
        for tier in self.opened() {
            tier.hot.close();
            tier.warm.close();
        }
    }
}
