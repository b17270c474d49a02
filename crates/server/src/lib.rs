//! tidemark-server: HTTP server for tidemark.
//!
//! Provides the REST API, per-dependency circuit breakers, the fan-out query
//! engine, and the background aging jobs. Storage and tiering live in
//! `tidemark-core`.

/// REST API layer: Axum router, HTTP handlers, models, metrics.
pub mod api;
/// Circuit breakers and their registry.
pub mod breaker;
/// Concurrent fan-out search across shards.
pub mod query;
/// Periodic Hot → Warm migration and Warm → Cold archival.
pub mod scheduler;
