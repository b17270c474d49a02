//! Prometheus metrics recording and background collection.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tidemark_core::storage::ShardStores;

/// Records HTTP request metrics.
pub fn record_request(method: &str, path: &str, status: u16, duration: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];
    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Records an accepted Hot write.
pub fn record_ingest(shard_id: u32) {
    counter!("tidemark_ingest_total", "shard" => shard_id.to_string()).increment(1);
}

/// Records a fan-out search. `scope` is `owner` or `all`.
pub fn record_search(scope: &'static str, failed_shards: usize, duration: Duration) {
    counter!("tidemark_search_total", "scope" => scope).increment(1);
    histogram!("tidemark_search_duration_seconds", "scope" => scope)
        .record(duration.as_secs_f64());
    if failed_shards > 0 {
        counter!("tidemark_search_partial_total", "scope" => scope).increment(1);
    }
}

/// Updates per-tier record gauges from the opened shards.
pub fn update_tier_metrics(stores: &ShardStores) {
    let stats = stores.stats();
    let hot: usize = stats.iter().map(|s| s.hot_records).sum();
    let warm: usize = stats.iter().map(|s| s.warm_records).sum();
    gauge!("tidemark_records", "tier" => "hot").set(hot as f64);
    gauge!("tidemark_records", "tier" => "warm").set(warm as f64);
    gauge!("tidemark_open_shards").set(stats.len() as f64);
}
