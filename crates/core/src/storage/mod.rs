//! Storage layer: per-shard tier tables, disk persistence, and Cold export.
//!
//! Hot and Warm rows live in memory in [`TierTable`]s, one per tier per
//! shard, grouped by [`ShardStores`]. Durability comes from per-owner
//! partition snapshots (CRC32 footer, atomic temp-file + rename). Cold rows
//! are written once as columnar batches to an [`ObjectStore`].

/// Cold tier: columnar batch encoding and export to object storage.
pub mod cold;
/// Hot tier store.
pub mod hot;
/// Object storage capability and its local/in-memory backends.
pub mod object_store;
/// Partition snapshot save/load with atomic writes.
pub mod persistence;
/// Shard store registry.
pub mod shards;
/// Generic per-shard, per-tier record table.
pub mod table;
/// Warm tier store.
pub mod warm;

pub use cold::{fingerprint_for, ultra_summary, ColdExporter, ColumnarBatch, ExportReceipt};
pub use hot::HotStore;
pub use object_store::{LocalObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreKind};
pub use persistence::{load_partition, remove_partition, save_partition};
pub use shards::{ShardStats, ShardStores, ShardTier};
pub use table::{TierRow, TierTable};
pub use warm::{UpsertOutcome, WarmStore};
