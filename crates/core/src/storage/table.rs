//! Per-shard record table shared by the Hot and Warm tiers.
//!
//! Rows are grouped by owner: `owner_id -> (record_id -> row)`. A table is
//! either purely in memory or backed by a directory, in which case each owner
//! partition is persisted to `ShardRouter::path_for(owner, base_dir)` on every
//! mutation, before the mutation is acknowledged.

use crate::config;
use crate::error::{Error, Result};
use crate::routing::{validate_owner_id, ShardRouter};
use crate::storage::persistence::{load_partition, remove_partition, save_partition};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// A row that can live in a [`TierTable`].
pub trait TierRow: Clone + Serialize + DeserializeOwned + Send + Sync {
    fn owner_id(&self) -> &str;
    fn record_id(&self) -> &str;
    fn timestamp(&self) -> DateTime<Utc>;
}

type Partition<R> = BTreeMap<String, R>;

#[derive(Debug)]
struct TableState<R> {
    open: bool,
    partitions: HashMap<String, Partition<R>>,
}

/// Rows of one tier on one shard, behind a single writer lock.
#[derive(Debug)]
pub struct TierTable<R> {
    tier: &'static str,
    shard_id: u32,
    router: ShardRouter,
    base_dir: Option<PathBuf>,
    state: RwLock<TableState<R>>,
}

impl<R: TierRow> TierTable<R> {
    /// Creates an empty, open, memory-only table.
    pub fn in_memory(tier: &'static str, shard_id: u32, router: ShardRouter) -> Self {
        Self {
            tier,
            shard_id,
            router,
            base_dir: None,
            state: RwLock::new(TableState {
                open: true,
                partitions: HashMap::new(),
            }),
        }
    }

    /// Opens a disk-backed table, loading every partition of `shard_id`
    /// found under `base_dir`.
    ///
    /// Unreadable partitions and partitions whose owner does not route to
    /// this shard are skipped with a warning.
    pub fn open(
        tier: &'static str,
        shard_id: u32,
        router: ShardRouter,
        base_dir: &Path,
    ) -> Result<Self> {
        let mut partitions = HashMap::new();
        let dir = ShardRouter::shard_dir(base_dir, shard_id);
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|s| s.to_str()) != Some(config::STORE_EXTENSION) {
                    continue;
                }
                let Some(owner) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if validate_owner_id(owner).is_err() || router.shard_for(owner) != shard_id {
                    tracing::warn!(
                        tier,
                        shard_id,
                        path = %path.display(),
                        "skipping partition that does not belong to this shard"
                    );
                    continue;
                }
                match load_partition::<Vec<R>>(&path) {
                    Ok(rows) => {
                        let partition: Partition<R> = rows
                            .into_iter()
                            .filter(|r| r.owner_id() == owner)
                            .map(|r| (r.record_id().to_string(), r))
                            .collect();
                        if !partition.is_empty() {
                            partitions.insert(owner.to_string(), partition);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load {:?}: {}", path, e);
                    }
                }
            }
        }

        let rows: usize = partitions.values().map(BTreeMap::len).sum();
        tracing::debug!(tier, shard_id, owners = partitions.len(), rows, "opened tier table");

        Ok(Self {
            tier,
            shard_id,
            router,
            base_dir: Some(base_dir.to_path_buf()),
            state: RwLock::new(TableState {
                open: true,
                partitions,
            }),
        })
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn is_open(&self) -> bool {
        self.state.read().open
    }

    pub fn is_persistent(&self) -> bool {
        self.base_dir.is_some()
    }

    /// Releases all rows. Every later operation fails with `NotInitialized`.
    pub fn close(&self) {
        let mut state = self.state.write();
        state.open = false;
        state.partitions.clear();
    }

    fn not_initialized(&self) -> Error {
        Error::NotInitialized(format!("{} store for shard {}", self.tier, self.shard_id))
    }

    fn check_owner(&self, owner_id: &str) -> Result<()> {
        validate_owner_id(owner_id)?;
        let routed = self.router.shard_for(owner_id);
        if routed != self.shard_id {
            return Err(Error::InvalidRecord(format!(
                "owner '{}' routes to shard {}, not {}",
                owner_id, routed, self.shard_id
            )));
        }
        Ok(())
    }

    fn persist(&self, owner_id: &str, partition: Option<&Partition<R>>) -> Result<()> {
        let Some(base_dir) = &self.base_dir else {
            return Ok(());
        };
        let path = self.router.path_for(owner_id, base_dir)?;
        match partition {
            Some(p) if !p.is_empty() => {
                let rows: Vec<&R> = p.values().collect();
                save_partition(&rows, &path)
            }
            _ => remove_partition(&path),
        }
    }

    /// Inserts `row`. With `replace == false` an existing id is a
    /// `DuplicateRecord` error; otherwise the previous row is returned.
    ///
    /// On a persistence failure the in-memory change is rolled back.
    pub fn insert(&self, row: R, replace: bool) -> Result<Option<R>> {
        self.check_owner(row.owner_id())?;
        let mut state = self.state.write();
        if !state.open {
            return Err(self.not_initialized());
        }

        let owner_id = row.owner_id().to_string();
        let record_id = row.record_id().to_string();
        let partition = state.partitions.entry(owner_id.clone()).or_default();
        if !replace && partition.contains_key(&record_id) {
            return Err(Error::DuplicateRecord {
                owner_id,
                record_id,
            });
        }
        let previous = partition.insert(record_id.clone(), row);

        if let Err(e) = self.persist(&owner_id, state.partitions.get(&owner_id)) {
            if let Some(partition) = state.partitions.get_mut(&owner_id) {
                match previous {
                    Some(prev) => {
                        partition.insert(record_id, prev);
                    }
                    None => {
                        partition.remove(&record_id);
                    }
                }
                if partition.is_empty() {
                    state.partitions.remove(&owner_id);
                }
            }
            return Err(e);
        }
        Ok(previous)
    }

    pub fn get(&self, owner_id: &str, record_id: &str) -> Result<Option<R>> {
        let state = self.state.read();
        if !state.open {
            return Err(self.not_initialized());
        }
        Ok(state
            .partitions
            .get(owner_id)
            .and_then(|p| p.get(record_id))
            .cloned())
    }

    /// Removes a row, returning it if it existed.
    pub fn remove(&self, owner_id: &str, record_id: &str) -> Result<Option<R>> {
        let mut state = self.state.write();
        if !state.open {
            return Err(self.not_initialized());
        }
        let Some(partition) = state.partitions.get_mut(owner_id) else {
            return Ok(None);
        };
        let Some(removed) = partition.remove(record_id) else {
            return Ok(None);
        };

        if let Err(e) = self.persist(owner_id, state.partitions.get(owner_id)) {
            if let Some(partition) = state.partitions.get_mut(owner_id) {
                partition.insert(record_id.to_string(), removed);
            }
            return Err(e);
        }
        if state.partitions.get(owner_id).is_some_and(BTreeMap::is_empty) {
            state.partitions.remove(owner_id);
        }
        Ok(Some(removed))
    }

    /// Applies `f` to every row (or only `owner_id`'s rows) under one read
    /// lock and collects the `Some` results.
    pub fn filter_map<T>(
        &self,
        owner_id: Option<&str>,
        mut f: impl FnMut(&R) -> Option<T>,
    ) -> Result<Vec<T>> {
        let state = self.state.read();
        if !state.open {
            return Err(self.not_initialized());
        }
        let out = match owner_id {
            Some(owner) => state
                .partitions
                .get(owner)
                .map(|p| p.values().filter_map(&mut f).collect())
                .unwrap_or_default(),
            None => state
                .partitions
                .values()
                .flat_map(BTreeMap::values)
                .filter_map(&mut f)
                .collect(),
        };
        Ok(out)
    }

    /// Rows with `timestamp < cutoff`, oldest first.
    pub fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<R>> {
        let mut rows = self.filter_map(None, |r| (r.timestamp() < cutoff).then(|| r.clone()))?;
        rows.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.owner_id().cmp(b.owner_id()))
                .then_with(|| a.record_id().cmp(b.record_id()))
        });
        Ok(rows)
    }

    pub fn len(&self) -> usize {
        self.state.read().partitions.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owners with at least one row, sorted.
    pub fn owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self.state.read().partitions.keys().cloned().collect();
        owners.sort();
        owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        owner: String,
        id: String,
        at: DateTime<Utc>,
        value: u32,
    }

    impl TierRow for Row {
        fn owner_id(&self) -> &str {
            &self.owner
        }
        fn record_id(&self) -> &str {
            &self.id
        }
        fn timestamp(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn row(owner: &str, id: &str, secs: i64, value: u32) -> Row {
        Row {
            owner: owner.into(),
            id: id.into(),
            at: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            value,
        }
    }

    fn single_shard() -> ShardRouter {
        ShardRouter::new(1).unwrap()
    }

    #[test]
    fn test_insert_get_remove() {
        let table = TierTable::in_memory("hot", 0, single_shard());
        assert!(table.insert(row("alice", "r1", 0, 1), false).unwrap().is_none());
        assert_eq!(table.get("alice", "r1").unwrap().unwrap().value, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove("alice", "r1").unwrap().unwrap().value, 1);
        assert!(table.remove("alice", "r1").unwrap().is_none());
        assert!(table.is_empty());
        assert!(table.owners().is_empty());
    }

    #[test]
    fn test_duplicate_rejected_unless_replacing() {
        let table = TierTable::in_memory("hot", 0, single_shard());
        table.insert(row("alice", "r1", 0, 1), false).unwrap();
        let err = table.insert(row("alice", "r1", 0, 2), false).unwrap_err();
        assert!(matches!(err, Error::DuplicateRecord { .. }));
        assert_eq!(table.get("alice", "r1").unwrap().unwrap().value, 1);

        let prev = table.insert(row("alice", "r1", 0, 3), true).unwrap();
        assert_eq!(prev.unwrap().value, 1);
        assert_eq!(table.get("alice", "r1").unwrap().unwrap().value, 3);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_record_id_for_different_owners() {
        let table = TierTable::in_memory("hot", 0, single_shard());
        table.insert(row("alice", "r1", 0, 1), false).unwrap();
        table.insert(row("bob", "r1", 0, 2), false).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.owners(), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_wrong_shard_rejected() {
        let router = ShardRouter::new(16).unwrap();
        let shard = router.shard_for("system-1");
        let other = (shard + 1) % 16;
        let table = TierTable::in_memory("hot", other, router);
        let err = table.insert(row("system-1", "r", 0, 0), false).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)));
    }

    #[test]
    fn test_closed_table_rejects_operations() {
        let table = TierTable::in_memory("warm", 0, single_shard());
        table.insert(row("alice", "r1", 0, 1), false).unwrap();
        table.close();
        assert!(!table.is_open());
        assert!(matches!(
            table.get("alice", "r1").unwrap_err(),
            Error::NotInitialized(_)
        ));
        assert!(matches!(
            table.insert(row("alice", "r2", 0, 1), false).unwrap_err(),
            Error::NotInitialized(_)
        ));
        assert!(table.older_than(Utc::now()).is_err());
    }

    #[test]
    fn test_older_than_sorted_oldest_first() {
        let table = TierTable::in_memory("hot", 0, single_shard());
        table.insert(row("alice", "late", 30, 0), false).unwrap();
        table.insert(row("bob", "early", 10, 0), false).unwrap();
        table.insert(row("alice", "mid", 20, 0), false).unwrap();
        table.insert(row("alice", "new", 100, 0), false).unwrap();
        let cutoff = DateTime::from_timestamp(1_700_000_050, 0).unwrap();
        let ids: Vec<String> = table
            .older_than(cutoff)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_filter_map_scoped_to_owner() {
        let table = TierTable::in_memory("hot", 0, single_shard());
        table.insert(row("alice", "a", 0, 1), false).unwrap();
        table.insert(row("bob", "b", 0, 2), false).unwrap();
        let values = table.filter_map(Some("bob"), |r| Some(r.value)).unwrap();
        assert_eq!(values, vec![2]);
        let mut all = table.filter_map(None, |r| Some(r.value)).unwrap();
        all.sort();
        assert_eq!(all, vec![1, 2]);
        assert!(table.filter_map(Some("carol"), |r| Some(r.value)).unwrap().is_empty());
    }

    #[test]
    fn test_persistent_table_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let router = ShardRouter::new(4).unwrap();
        let shard = router.shard_for("system-1");
        {
            let table = TierTable::open("hot", shard, router, dir.path()).unwrap();
            table.insert(row("system-1", "r1", 0, 7), false).unwrap();
            table.insert(row("system-1", "r2", 5, 8), false).unwrap();
            table.remove("system-1", "r2").unwrap();
        }
        let path = router.path_for("system-1", dir.path()).unwrap();
        assert!(path.exists());

        let reopened: TierTable<Row> = TierTable::open("hot", shard, router, dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("system-1", "r1").unwrap().unwrap().value, 7);
    }

    #[test]
    fn test_empty_partition_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let router = single_shard();
        let table = TierTable::open("hot", 0, router, dir.path()).unwrap();
        table.insert(row("alice", "r1", 0, 1), false).unwrap();
        let path = router.path_for("alice", dir.path()).unwrap();
        assert!(path.exists());
        table.remove("alice", "r1").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_partition_skipped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let router = single_shard();
        {
            let table = TierTable::open("hot", 0, router, dir.path()).unwrap();
            table.insert(row("alice", "r1", 0, 1), false).unwrap();
            table.insert(row("bob", "r1", 0, 2), false).unwrap();
        }
        let bob = router.path_for("bob", dir.path()).unwrap();
        fs::write(&bob, b"garbage").unwrap();

        let table: TierTable<Row> = TierTable::open("hot", 0, router, dir.path()).unwrap();
        assert_eq!(table.owners(), vec!["alice".to_string()]);
    }
}
