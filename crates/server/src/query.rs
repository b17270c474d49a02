//! Fan-out similarity search across shards.
//!
//! A query resolves its target shards through the [`ShardRouter`], calls
//! every shard concurrently through that shard's circuit breaker, and merges
//! whatever came back in time. A shard that times out, errors, or has an open
//! circuit is logged and left out; it never fails the query. When every shard
//! fails the result is simply empty.
//!
//! Malformed queries, including a vector of the wrong dimension, are rejected
//! before any shard is contacted so that client mistakes never count against a
//! shard's breaker.

use crate::breaker::{BreakerError, BreakerRegistry};
use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tidemark_core::search::{merge, SearchHit};
use tidemark_core::storage::ShardStores;
use tidemark_core::{config, ShardRouter};

/// Parameters passed to every shard of one query.
#[derive(Debug, Clone)]
pub struct ShardQuery {
    pub vector: Arc<[f32]>,
    pub owner_id: Option<String>,
    pub limit: usize,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShardError {
    #[error("shard {shard_id} timed out after {after:?}")]
    Timeout { shard_id: u32, after: Duration },
    #[error("shard {shard_id} circuit is open")]
    CircuitOpen { shard_id: u32 },
    #[error("shard {shard_id} failed: {message}")]
    Failed { shard_id: u32, message: String },
}

impl ShardError {
    pub fn shard_id(&self) -> u32 {
        match self {
            ShardError::Timeout { shard_id, .. }
            | ShardError::CircuitOpen { shard_id }
            | ShardError::Failed { shard_id, .. } => *shard_id,
        }
    }

    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            ShardError::Timeout { .. } => "timeout",
            ShardError::CircuitOpen { .. } => "circuit_open",
            ShardError::Failed { .. } => "error",
        }
    }
}

/// Searches one shard. Implementations must be cancel-safe: a call may be
/// dropped when it exceeds its time budget.
#[async_trait]
pub trait ShardSearcher: Send + Sync {
    async fn search(&self, shard_id: u32, query: &ShardQuery) -> Result<Vec<SearchHit>, ShardError>;
}

/// Searches the Hot and Warm tiers of shards held by this process.
#[derive(Debug, Clone)]
pub struct LocalShardSearcher {
    stores: Arc<ShardStores>,
}

impl LocalShardSearcher {
    pub fn new(stores: Arc<ShardStores>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl ShardSearcher for LocalShardSearcher {
    async fn search(&self, shard_id: u32, query: &ShardQuery) -> Result<Vec<SearchHit>, ShardError> {
        let Some(tier) = self.stores.get(shard_id) else {
            return Ok(Vec::new());
        };
        let query = query.clone();
        let failed = |message: String| ShardError::Failed { shard_id, message };

        tokio::task::spawn_blocking(move || {
            let owner = query.owner_id.as_deref();
            let mut hits =
                tier.hot
                    .search_similar(&query.vector, owner, query.limit, query.threshold)?;
            hits.extend(tier.warm.search_similar(
                &query.vector,
                owner,
                query.limit,
                query.threshold,
            )?);
            Ok::<_, tidemark_core::Error>(hits)
        })
        .await
        .map_err(|e| failed(format!("search task failed: {e}")))?
        .map_err(|e| failed(e.to_string()))
    }
}

/// Per-shard result, collected before successes and failures are separated.
#[derive(Debug)]
pub enum ShardOutcome {
    Hits { shard_id: u32, hits: Vec<SearchHit> },
    Failed(ShardError),
}

#[derive(Debug, Clone, Serialize)]
pub struct FanoutResult {
    pub hits: Vec<SearchHit>,
    pub shards_queried: usize,
    pub failed_shards: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Owner id failed validation; no shard was contacted.
    #[error(transparent)]
    Placement(#[from] tidemark_core::Error),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Breaker name for a shard, e.g. `shard-007`.
pub fn shard_breaker_name(shard_id: u32) -> String {
    format!("shard-{:03}", shard_id)
}

pub struct DistributedQueryEngine {
    router: ShardRouter,
    dimension: usize,
    searcher: Arc<dyn ShardSearcher>,
    breakers: Arc<BreakerRegistry>,
}

impl DistributedQueryEngine {
    /// `dimension` is the embedding length every shard stores; queries of
    /// any other length are refused up front.
    pub fn new(
        router: ShardRouter,
        dimension: usize,
        searcher: Arc<dyn ShardSearcher>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            router,
            dimension,
            searcher,
            breakers,
        }
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Searches every target shard concurrently and merges the answers.
    ///
    /// Each shard gets its own `timeout`; the call as a whole returns once
    /// every shard has answered or run out of time. Only invalid input is
    /// an error.
    pub async fn search_all_shards(
        &self,
        query_vector: Vec<f32>,
        owner_id: Option<&str>,
        limit: usize,
        threshold: f32,
        timeout: Duration,
    ) -> Result<FanoutResult, QueryError> {
        let targets = self.router.target_shards(owner_id)?;
        validate_query(&query_vector, self.dimension, limit, threshold, timeout)?;

        let query = ShardQuery {
            vector: query_vector.into(),
            owner_id: owner_id.map(str::to_string),
            limit,
            threshold,
        };

        let outcomes = if let [shard_id] = targets.as_slice() {
            vec![self.query_shard(*shard_id, &query, timeout).await]
        } else {
            join_all(
                targets
                    .iter()
                    .map(|&shard_id| self.query_shard(shard_id, &query, timeout)),
            )
            .await
        };

        let mut result_sets = Vec::with_capacity(outcomes.len());
        let mut failed_shards = Vec::new();
        for outcome in outcomes {
            match outcome {
                ShardOutcome::Hits { hits, .. } => result_sets.push(hits),
                ShardOutcome::Failed(e) => {
                    tracing::warn!(shard_id = e.shard_id(), reason = e.reason(), "shard search failed: {}", e);
                    counter!("tidemark_shard_failures_total", "reason" => e.reason()).increment(1);
                    failed_shards.push(e.shard_id());
                }
            }
        }

        Ok(FanoutResult {
            hits: merge(result_sets, limit),
            shards_queried: targets.len(),
            failed_shards,
        })
    }

    async fn query_shard(&self, shard_id: u32, query: &ShardQuery, timeout: Duration) -> ShardOutcome {
        let breaker = self.breakers.get_or_create(&shard_breaker_name(shard_id));
        let searcher = &self.searcher;
        match breaker
            .call_with_timeout(timeout, || searcher.search(shard_id, query))
            .await
        {
            Ok(hits) => ShardOutcome::Hits { shard_id, hits },
            Err(BreakerError::Open { .. }) => ShardOutcome::Failed(ShardError::CircuitOpen { shard_id }),
            Err(BreakerError::Timeout { after, .. }) => {
                ShardOutcome::Failed(ShardError::Timeout { shard_id, after })
            }
            Err(BreakerError::Inner(e)) => ShardOutcome::Failed(e),
        }
    }
}

fn validate_query(
    vector: &[f32],
    dimension: usize,
    limit: usize,
    threshold: f32,
    timeout: Duration,
) -> Result<(), QueryError> {
    if vector.is_empty() {
        return Err(QueryError::InvalidQuery("query vector is empty".into()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(QueryError::InvalidQuery(
            "query vector contains NaN or Inf".into(),
        ));
    }
    if vector.len() != dimension {
        return Err(QueryError::InvalidQuery(format!(
            "query vector has dimension {}, expected {}",
            vector.len(),
            dimension
        )));
    }
    if limit > config::MAX_LIMIT {
        return Err(QueryError::InvalidQuery(format!(
            "limit exceeds {}",
            config::MAX_LIMIT
        )));
    }
    if !(0.0..=1.0).contains(&threshold) {
        return Err(QueryError::InvalidQuery(
            "threshold must be within [0, 1]".into(),
        ));
    }
    if timeout.is_zero() {
        return Err(QueryError::InvalidQuery("timeout must be > 0".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tidemark_core::record::{HotRecord, Metadata, Tier};

    fn hit(id: &str, similarity: f32) -> SearchHit {
        SearchHit {
            owner_id: "owner".into(),
            record_id: id.into(),
            content_or_summary: String::new(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            similarity,
            tier: Tier::Hot,
        }
    }

    enum Behavior {
        Answer(Vec<SearchHit>),
        Fail,
        Hang,
    }

    #[derive(Default)]
    struct ScriptedSearcher {
        shards: HashMap<u32, Behavior>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ShardSearcher for ScriptedSearcher {
        async fn search(&self, shard_id: u32, query: &ShardQuery) -> Result<Vec<SearchHit>, ShardError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.shards.get(&shard_id) {
                Some(Behavior::Answer(hits)) => {
                    Ok(hits.iter().take(query.limit).cloned().collect())
                }
                Some(Behavior::Fail) => Err(ShardError::Failed {
                    shard_id,
                    message: "disk on fire".into(),
                }),
                Some(Behavior::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
                None => Ok(Vec::new()),
            }
        }
    }

    fn engine(shards: u32, searcher: Arc<ScriptedSearcher>, breakers: Arc<BreakerRegistry>) -> DistributedQueryEngine {
        DistributedQueryEngine::new(ShardRouter::new(shards).unwrap(), 1, searcher, breakers)
    }

    const T: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_fanout_merges_and_dedupes() {
        let mut searcher = ScriptedSearcher::default();
        searcher.shards.insert(0, Behavior::Answer(vec![hit("a", 0.9), hit("c", 0.3)]));
        searcher.shards.insert(1, Behavior::Answer(vec![hit("a", 0.95), hit("b", 0.5)]));
        searcher.shards.insert(3, Behavior::Answer(vec![hit("d", 0.7)]));
        let searcher = Arc::new(searcher);
        let engine = engine(4, searcher.clone(), Arc::new(BreakerRegistry::default()));

        let result = engine.search_all_shards(vec![1.0], None, 3, 0.0, T).await.unwrap();
        let ids: Vec<&str> = result.hits.iter().map(|h| h.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d", "b"]);
        assert_eq!(result.hits[0].similarity, 0.9);
        assert_eq!(result.shards_queried, 4);
        assert!(result.failed_shards.is_empty());
        assert_eq!(searcher.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_is_tolerated() {
        let mut searcher = ScriptedSearcher::default();
        searcher.shards.insert(0, Behavior::Answer(vec![hit("a", 0.9)]));
        searcher.shards.insert(1, Behavior::Fail);
        searcher.shards.insert(2, Behavior::Hang);
        searcher.shards.insert(3, Behavior::Answer(vec![hit("b", 0.8)]));
        let engine = engine(4, Arc::new(searcher), Arc::new(BreakerRegistry::default()));

        let start = tokio::time::Instant::now();
        let result = engine.search_all_shards(vec![1.0], None, 10, 0.0, T).await.unwrap();
        assert!(start.elapsed() < T + Duration::from_millis(50));

        let ids: Vec<&str> = result.hits.iter().map(|h| h.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let mut failed = result.failed_shards.clone();
        failed.sort();
        assert_eq!(failed, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_shards_failing_returns_empty() {
        let mut searcher = ScriptedSearcher::default();
        for shard in 0..3 {
            searcher.shards.insert(shard, Behavior::Fail);
        }
        let engine = engine(3, Arc::new(searcher), Arc::new(BreakerRegistry::default()));
        let result = engine.search_all_shards(vec![1.0], None, 10, 0.0, T).await.unwrap();
        assert!(result.hits.is_empty());
        assert_eq!(result.failed_shards.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_query_hits_single_shard() {
        let router = ShardRouter::new(16).unwrap();
        let shard = router.shard_for("system-1");
        let mut searcher = ScriptedSearcher::default();
        searcher.shards.insert(shard, Behavior::Answer(vec![hit("mine", 0.6)]));
        let searcher = Arc::new(searcher);
        let engine = engine(16, searcher.clone(), Arc::new(BreakerRegistry::default()));

        let result = engine
            .search_all_shards(vec![1.0], Some("system-1"), 10, 0.0, T)
            .await
            .unwrap();
        assert_eq!(result.shards_queried, 1);
        assert_eq!(result.hits.len(), 1);
        assert_eq!(searcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_owner_rejected_before_any_shard_call() {
        let searcher = Arc::new(ScriptedSearcher::default());
        let engine = engine(4, searcher.clone(), Arc::new(BreakerRegistry::default()));
        let err = engine
            .search_all_shards(vec![1.0], Some("../../etc/passwd"), 10, 0.0, T)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Placement(_)));
        assert_eq!(searcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_parameters_rejected() {
        let engine = engine(2, Arc::new(ScriptedSearcher::default()), Arc::new(BreakerRegistry::default()));
        for (vector, threshold, timeout) in [
            (vec![], 0.0, T),
            (vec![f32::NAN], 0.0, T),
            (vec![1.0], 1.5, T),
            (vec![1.0], 0.0, Duration::ZERO),
        ] {
            let err = engine
                .search_all_shards(vector, None, 10, threshold, timeout)
                .await
                .unwrap_err();
            assert!(matches!(err, QueryError::InvalidQuery(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_dimension_never_reaches_a_breaker() {
        let mut searcher = ScriptedSearcher::default();
        searcher.shards.insert(0, Behavior::Answer(vec![hit("a", 0.9)]));
        let searcher = Arc::new(searcher);
        let breakers = Arc::new(BreakerRegistry::default());
        let engine = engine(1, searcher.clone(), breakers.clone());

        for _ in 0..config::BREAKER_FAILURE_THRESHOLD + 2 {
            let err = engine
                .search_all_shards(vec![1.0, 0.0, 0.0], None, 10, 0.0, T)
                .await
                .unwrap_err();
            assert!(matches!(err, QueryError::InvalidQuery(_)));
        }
        assert_eq!(searcher.calls.load(Ordering::SeqCst), 0);
        assert!(breakers.is_empty());

        let result = engine.search_all_shards(vec![1.0], None, 10, 0.0, T).await.unwrap();
        assert_eq!(result.hits.len(), 1);
        assert!(result.failed_shards.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_returns_empty() {
        let mut searcher = ScriptedSearcher::default();
        searcher.shards.insert(0, Behavior::Answer(vec![hit("a", 0.9)]));
        let engine = engine(1, Arc::new(searcher), Arc::new(BreakerRegistry::default()));
        let result = engine.search_all_shards(vec![1.0], None, 0, 0.0, T).await.unwrap();
        assert!(result.hits.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_shard_trips_its_breaker_only() {
        let mut searcher = ScriptedSearcher::default();
        searcher.shards.insert(0, Behavior::Answer(vec![hit("a", 0.9)]));
        searcher.shards.insert(1, Behavior::Fail);
        let searcher = Arc::new(searcher);
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        }));
        let engine = engine(2, searcher.clone(), breakers.clone());

        for _ in 0..2 {
            engine.search_all_shards(vec![1.0], None, 10, 0.0, T).await.unwrap();
        }
        assert_eq!(searcher.calls.load(Ordering::SeqCst), 4);

        let result = engine.search_all_shards(vec![1.0], None, 10, 0.0, T).await.unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.failed_shards, vec![1]);
        // Shard 1 was rejected by its open circuit without being called.
        assert_eq!(searcher.calls.load(Ordering::SeqCst), 5);

        let open = breakers.get_stats("shard-001").unwrap();
        assert_eq!(open.state, crate::breaker::CircuitState::Open);
        assert_eq!(open.rejected_calls, 1);
        let healthy = breakers.get_stats("shard-000").unwrap();
        assert_eq!(healthy.state, crate::breaker::CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_local_searcher_reads_hot_and_warm() {
        let router = ShardRouter::new(4).unwrap();
        let stores = Arc::new(ShardStores::in_memory(router, 2));
        let shard = stores
            .write(HotRecord::new(
                "alice",
                "r1",
                "Hello there.",
                vec![1.0, 0.0],
                Utc::now(),
                Metadata::new(),
            ))
            .unwrap();
        let searcher = LocalShardSearcher::new(stores);
        let query = ShardQuery {
            vector: vec![1.0, 0.0].into(),
            owner_id: None,
            limit: 5,
            threshold: 0.5,
        };

        let hits = searcher.search(shard, &query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content_or_summary, "Hello there.");

        let other = (shard + 1) % 4;
        assert!(searcher.search(other, &query).await.unwrap().is_empty());

        let bad = ShardQuery {
            vector: vec![1.0, 0.0, 0.0].into(),
            ..query
        };
        assert!(matches!(
            searcher.search(shard, &bad).await.unwrap_err(),
            ShardError::Failed { .. }
        ));
    }
}
