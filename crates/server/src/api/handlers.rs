//! HTTP request handlers and shared application state.

use crate::api::errors::ApiError;
use crate::api::metrics;
use crate::api::models::*;
use crate::breaker::{BreakerRegistry, BreakerStats};
use crate::query::DistributedQueryEngine;
use crate::scheduler::{run_migration, ColdArchiver};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidemark_core::storage::{ShardStats, ShardStores};
use tidemark_core::{AgingService, ArchiveStats, HotRecord, MigrationStats};

/// Shared application state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub stores: Arc<ShardStores>,
    pub aging: Arc<AgingService>,
    pub archiver: Arc<ColdArchiver>,
    pub engine: Arc<DistributedQueryEngine>,
    pub breakers: Arc<BreakerRegistry>,
    pub prometheus_handle: PrometheusHandle,
    /// Per-shard budget for searches that do not set `timeout_ms`.
    pub query_timeout: Duration,
    pub hot_cutoff_days: u32,
    pub warm_cutoff_days: u32,
    pub start_time: Instant,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.stores.stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        shard_count: state.stores.router().shard_count(),
        dimension: state.stores.dimension(),
        opened_shards: stats.len(),
        hot_records: stats.iter().map(|s| s.hot_records).sum(),
        warm_records: stats.iter().map(|s| s.warm_records).sum(),
    })
}

/// `GET /metrics`
pub async fn metrics_endpoint(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// `POST /records`
pub async fn ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let metadata = json_to_metadata(req.metadata).map_err(|key| {
        ApiError::BadRequest(format!(
            "Metadata '{}' must be a boolean, number or string",
            key
        ))
    })?;
    let record = HotRecord::new(
        req.owner_id,
        req.record_id,
        req.content,
        req.embedding,
        req.timestamp.unwrap_or_else(Utc::now),
        metadata,
    );
    let owner_id = record.owner_id.clone();
    let record_id = record.record_id.clone();

    let stores = Arc::clone(&state.stores);
    let shard_id = tokio::task::spawn_blocking(move || stores.write(record))
        .await
        .map_err(|e| ApiError::Internal(format!("Task join error: {}", e)))??;

    metrics::record_ingest(shard_id);
    tracing::debug!(owner_id = %owner_id, record_id = %record_id, shard_id, "ingested record");
    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            owner_id,
            record_id,
            shard_id,
        }),
    ))
}

/// `POST /search`
pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.query_timeout);
    let scope = if req.owner_id.is_some() { "owner" } else { "all" };

    let start = Instant::now();
    let result = state
        .engine
        .search_all_shards(
            req.query_embedding,
            req.owner_id.as_deref(),
            req.limit,
            req.threshold,
            timeout,
        )
        .await?;
    let took = start.elapsed();
    metrics::record_search(scope, result.failed_shards.len(), took);

    Ok(Json(SearchResponse {
        results: result.hits.into_iter().map(Into::into).collect(),
        shards_queried: result.shards_queried,
        failed_shards: result.failed_shards,
        took_ms: took.as_millis() as u64,
    }))
}

/// `POST /admin/migrate`
pub async fn migrate(
    State(state): State<AppState>,
    body: Option<Json<AgingRequest>>,
) -> Result<Json<MigrationStats>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let cutoff_days = req.cutoff_days.unwrap_or(state.hot_cutoff_days);
    let stats = run_migration(Arc::clone(&state.aging), cutoff_days).await?;
    Ok(Json(stats))
}

/// `POST /admin/archive`
pub async fn archive(
    State(state): State<AppState>,
    body: Option<Json<AgingRequest>>,
) -> Result<Json<ArchiveStats>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let cutoff_days = req.cutoff_days.unwrap_or(state.warm_cutoff_days);
    let stats = state.archiver.run(cutoff_days).await?;
    Ok(Json(stats))
}

/// `GET /admin/breakers`
pub async fn list_breakers(State(state): State<AppState>) -> Json<Vec<BreakerStats>> {
    Json(state.breakers.all_stats())
}

/// `GET /admin/breakers/:name`
pub async fn get_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<BreakerStats>, ApiError> {
    state
        .breakers
        .get_stats(&name)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Breaker '{}' not found", name)))
}

/// `GET /admin/shards`
pub async fn list_shards(State(state): State<AppState>) -> Json<Vec<ShardStats>> {
    Json(state.stores.stats())
}
