//! # tidemark-core
//!
//! Sharded, tiered record storage with similarity search.
//!
//! Owners are placed on shards by a deterministic hash ([`routing`]). Each
//! shard keeps recent full-fidelity records in a Hot store and older,
//! summarized, quantized records in a Warm store ([`storage`]); the
//! [`aging`] service moves records down the tiers and finally exports them
//! to immutable Cold batches in object storage. Per-shard search results are
//! merged by [`search::aggregate`].
//!
//! This crate has no async dependencies. The network server, fan-out query
//! engine, and circuit breakers live in `tidemark-server`.

/// Hot → Warm migration and Warm → Cold archival.
pub mod aging;
/// Global configuration constants: limits, defaults, and tuning parameters.
pub mod config;
/// Error type and `Result` alias.
pub mod error;
/// Scalar quantization: f32 → u8 compression and cosine similarity kernels.
pub mod quantization;
/// Record types for the Hot, Warm, and Cold tiers.
pub mod record;
/// Deterministic owner → shard placement and store paths.
pub mod routing;
/// Search result rows and cross-shard aggregation.
pub mod search;
/// Storage layer: tier tables, persistence, object storage, and shard registry.
pub mod storage;
/// Extractive summaries.
pub mod summarize;

pub use aging::{cutoff_before, AgingConfig, AgingService, ArchiveStats, ColdBatch, MigrationStats};
pub use error::{Error, Result};
pub use record::{ColdRecord, HotRecord, Metadata, MetadataValue, Tier, WarmRecord};
pub use routing::{validate_owner_id, ShardRouter};
pub use search::{merge, SearchHit};
