//! Global configuration constants for tidemark.
//!
//! All placement parameters, input validation limits, tier tuning and server
//! defaults are defined here. These are compile-time defaults; runtime
//! configuration is handled via CLI arguments and environment variables in
//! the server's `main.rs`.

/// Default number of shards owner ids are hashed across.
///
/// Changing this value for an existing data directory relocates every owner,
/// so it must stay fixed for the lifetime of a deployment.
pub const DEFAULT_SHARD_COUNT: u32 = 256;

/// Default embedding dimension (MiniLM-class sentence embeddings).
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

/// Maximum allowed embedding dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum length of an owner id in bytes.
pub const MAX_OWNER_ID_LEN: usize = 128;

/// Maximum length of a record id in bytes.
pub const MAX_RECORD_ID_LEN: usize = 256;

/// Maximum length of record content in bytes.
pub const MAX_CONTENT_LEN: usize = 1_000_000;

/// Maximum number of metadata keys per record.
pub const MAX_METADATA_KEYS: usize = 64;

/// Maximum total serialized size of metadata in bytes (64 KB).
pub const MAX_METADATA_BYTES: usize = 65_536;

/// Maximum number of results (`limit`) per search request.
pub const MAX_LIMIT: usize = 10_000;

/// Upper bound on the extractive summary stored in the Warm tier.
pub const DEFAULT_SUMMARY_MAX_CHARS: usize = 200;

/// Upper bound on the one-sentence summary stored in the Cold tier.
pub const ULTRA_SUMMARY_MAX_CHARS: usize = 120;

/// File extension of per-owner partition files inside a shard directory.
pub const STORE_EXTENSION: &str = "store";

/// File extension of exported cold batches.
pub const COLD_BATCH_EXTENSION: &str = "tcb";

/// Default object key prefix for cold batches.
pub const DEFAULT_COLD_PREFIX: &str = "cold";

/// Default age (days) after which Hot rows migrate to Warm.
pub const DEFAULT_HOT_CUTOFF_DAYS: u32 = 7;

/// Default age (days) after which Warm rows are archived to Cold.
pub const DEFAULT_WARM_CUTOFF_DAYS: u32 = 30;

/// Default interval (in seconds) between Hot → Warm migrations. 0 = disabled.
pub const DEFAULT_AGING_INTERVAL_SECS: u64 = 3600;

/// Default interval (in seconds) between Warm → Cold archive runs. 0 = disabled.
pub const DEFAULT_ARCHIVE_INTERVAL_SECS: u64 = 6 * 3600;

/// Default per-shard timeout for fan-out queries, in milliseconds.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 2_000;

/// Default similarity threshold applied when a query omits one.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.0;

/// Default number of results when a query omits `limit`.
pub const DEFAULT_LIMIT: usize = 10;

/// Consecutive failures before a circuit breaker opens.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Consecutive half-open successes before a circuit breaker closes.
pub const BREAKER_SUCCESS_THRESHOLD: u32 = 2;

/// Seconds an open circuit waits after the last failure before probing.
pub const BREAKER_OPEN_SECS: u64 = 30;

/// Upper bound on a single call made through a circuit breaker, in milliseconds.
pub const BREAKER_CALL_TIMEOUT_MS: u64 = 10_000;

/// Default HTTP server port.
pub const DEFAULT_PORT: u16 = 3040;

/// Default directory for tier data.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Per-request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum HTTP request body size in bytes (10 MB).
pub const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Maximum number of concurrent in-flight requests.
pub const MAX_CONCURRENT_REQUESTS: usize = 512;

/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Interval between tier gauge refreshes, in seconds.
pub const METRICS_REFRESH_SECS: u64 = 15;
