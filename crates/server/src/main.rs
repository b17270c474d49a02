use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidemark_core::config;
use tidemark_core::storage::{
    ColdExporter, LocalObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreKind, ShardStores,
};
use tidemark_core::{AgingConfig, AgingService, ShardRouter};
use tidemark_server::api::create_router;
use tidemark_server::api::handlers::AppState;
use tidemark_server::api::metrics;
use tidemark_server::breaker::{BreakerRegistry, CircuitBreakerConfig};
use tidemark_server::query::{DistributedQueryEngine, LocalShardSearcher};
use tidemark_server::scheduler::{self, ColdArchiver, OBJECT_STORE_BREAKER};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tidemark", about = "Sharded tiered record store with fan-out similarity search")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "TIDEMARK_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Data directory for Hot and Warm partitions
    #[arg(short, long, env = "TIDEMARK_DATA_DIR", default_value = config::DEFAULT_DATA_DIR)]
    data_dir: String,

    /// Number of shards. Changing it re-places every owner.
    #[arg(long, env = "TIDEMARK_SHARD_COUNT", default_value_t = config::DEFAULT_SHARD_COUNT)]
    shard_count: u32,

    /// Embedding dimension accepted by every store
    #[arg(long, env = "TIDEMARK_DIMENSION", default_value_t = config::DEFAULT_EMBEDDING_DIM)]
    dimension: usize,

    /// Cold object store backend (local or memory)
    #[arg(long, env = "TIDEMARK_OBJECT_STORE", default_value = "local")]
    object_store: ObjectStoreKind,

    /// Root directory of the local object store (default: <data_dir>/objects)
    #[arg(long, env = "TIDEMARK_OBJECT_STORE_DIR")]
    object_store_dir: Option<String>,

    /// Key prefix for Cold batches
    #[arg(long, env = "TIDEMARK_COLD_PREFIX", default_value = config::DEFAULT_COLD_PREFIX)]
    cold_prefix: String,

    /// Character budget of Warm summaries
    #[arg(long, env = "TIDEMARK_SUMMARY_MAX_CHARS", default_value_t = config::DEFAULT_SUMMARY_MAX_CHARS)]
    summary_max_chars: usize,

    /// Hot → Warm migration interval in seconds (0 = disabled)
    #[arg(long, env = "TIDEMARK_AGING_INTERVAL", default_value_t = config::DEFAULT_AGING_INTERVAL_SECS)]
    aging_interval: u64,

    /// Age in days after which Hot records move to Warm
    #[arg(long, env = "TIDEMARK_HOT_CUTOFF_DAYS", default_value_t = config::DEFAULT_HOT_CUTOFF_DAYS)]
    hot_cutoff_days: u32,

    /// Warm → Cold archive interval in seconds (0 = disabled)
    #[arg(long, env = "TIDEMARK_ARCHIVE_INTERVAL", default_value_t = config::DEFAULT_ARCHIVE_INTERVAL_SECS)]
    archive_interval: u64,

    /// Age in days after which Warm records move to Cold
    #[arg(long, env = "TIDEMARK_WARM_CUTOFF_DAYS", default_value_t = config::DEFAULT_WARM_CUTOFF_DAYS)]
    warm_cutoff_days: u32,

    /// Consecutive failures that open a circuit
    #[arg(long, env = "TIDEMARK_BREAKER_FAILURES", default_value_t = config::BREAKER_FAILURE_THRESHOLD)]
    breaker_failure_threshold: u32,

    /// Half-open successes that close a circuit
    #[arg(long, env = "TIDEMARK_BREAKER_SUCCESSES", default_value_t = config::BREAKER_SUCCESS_THRESHOLD)]
    breaker_success_threshold: u32,

    /// Seconds an open circuit waits before a trial call
    #[arg(long, env = "TIDEMARK_BREAKER_OPEN_SECS", default_value_t = config::BREAKER_OPEN_SECS)]
    breaker_open_secs: u64,

    /// Upper bound in milliseconds on any call through a breaker
    #[arg(long, env = "TIDEMARK_BREAKER_CALL_TIMEOUT_MS", default_value_t = config::BREAKER_CALL_TIMEOUT_MS)]
    breaker_call_timeout_ms: u64,

    /// Default per-shard search timeout in milliseconds
    #[arg(long, env = "TIDEMARK_QUERY_TIMEOUT_MS", default_value_t = config::DEFAULT_QUERY_TIMEOUT_MS)]
    query_timeout_ms: u64,

    /// Graceful shutdown timeout in seconds
    #[arg(long, env = "TIDEMARK_SHUTDOWN_TIMEOUT", default_value_t = config::DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(
                    "tidemark_server=info"
                        .parse()
                        .expect("valid directive literal"),
                )
                .add_directive(
                    "tidemark_core=info"
                        .parse()
                        .expect("valid directive literal"),
                ),
        )
        .init();

    let args = Args::parse();

    if args.port == 0 {
        eprintln!("Error: port must be > 0");
        std::process::exit(1);
    }
    if args.dimension == 0 || args.dimension > config::MAX_DIMENSION {
        eprintln!(
            "Error: dimension must be between 1 and {}",
            config::MAX_DIMENSION
        );
        std::process::exit(1);
    }
    if args.breaker_failure_threshold == 0 || args.breaker_success_threshold == 0 {
        eprintln!("Error: breaker thresholds must be > 0");
        std::process::exit(1);
    }
    if args.query_timeout_ms == 0 {
        eprintln!("Error: query timeout must be > 0");
        std::process::exit(1);
    }
    let data_dir = PathBuf::from(&args.data_dir);
    if data_dir.exists() && !data_dir.is_dir() {
        eprintln!(
            "Error: data_dir '{}' exists but is not a directory",
            args.data_dir
        );
        std::process::exit(1);
    }

    let router = ShardRouter::new(args.shard_count)?;
    let stores = Arc::new(ShardStores::persistent(router, args.dimension, &data_dir));
    let opened = stores.open_existing()?;
    tracing::info!(
        shard_count = args.shard_count,
        dimension = args.dimension,
        opened,
        "Shard stores ready"
    );

    let aging = Arc::new(AgingService::new(
        Arc::clone(&stores),
        AgingConfig {
            summary_max_chars: args.summary_max_chars,
        },
    ));

    let object_store: Arc<dyn ObjectStore> = match args.object_store {
        ObjectStoreKind::Local => {
            let root = args
                .object_store_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("objects"));
            tracing::info!("Cold batches go to local object store at {}", root.display());
            Arc::new(LocalObjectStore::new(root)?)
        }
        ObjectStoreKind::Memory => {
            tracing::warn!("Using in-memory object store: Cold batches are lost on exit");
            Arc::new(MemoryObjectStore::new())
        }
    };
    let exporter = Arc::new(ColdExporter::new(
        object_store,
        args.cold_prefix,
        data_dir.join("staging"),
    )?);

    let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: args.breaker_failure_threshold,
        success_threshold: args.breaker_success_threshold,
        timeout: Duration::from_secs(args.breaker_open_secs),
        call_timeout: Duration::from_millis(args.breaker_call_timeout_ms),
    }));
    let engine = Arc::new(DistributedQueryEngine::new(
        router,
        args.dimension,
        Arc::new(LocalShardSearcher::new(Arc::clone(&stores))),
        Arc::clone(&breakers),
    ));
    let archiver = Arc::new(ColdArchiver::new(
        Arc::clone(&aging),
        exporter,
        breakers.get_or_create(OBJECT_STORE_BREAKER),
    ));

    let prometheus_handle =
        metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // Spawn tier metrics background task
    let metrics_stores = Arc::clone(&stores);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config::METRICS_REFRESH_SECS));
        loop {
            interval.tick().await;
            metrics::update_tier_metrics(&metrics_stores);
        }
    });

    let aging_job = scheduler::spawn_aging_job(
        Arc::clone(&aging),
        Duration::from_secs(args.aging_interval),
        args.hot_cutoff_days,
    );
    let archive_job = scheduler::spawn_archive_job(
        Arc::clone(&archiver),
        Duration::from_secs(args.archive_interval),
        args.warm_cutoff_days,
    );

    let state = AppState {
        stores: Arc::clone(&stores),
        aging,
        archiver,
        engine,
        breakers,
        prometheus_handle,
        query_timeout: Duration::from_millis(args.query_timeout_ms),
        hot_cutoff_days: args.hot_cutoff_days,
        warm_cutoff_days: args.warm_cutoff_days,
        start_time: Instant::now(),
    };
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("tidemark listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await?;

    for job in [aging_job, archive_job].into_iter().flatten() {
        job.abort();
    }
    shutdown(&stores, args.shutdown_timeout).await;

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    tracing::info!("Shutting down gracefully, draining in-flight requests...");
}

/// Closes every store once in-flight blocking writes have had a chance to finish.
async fn shutdown(stores: &Arc<ShardStores>, timeout_secs: u64) {
    tracing::info!("All requests drained, closing shard stores...");
    let closing = Arc::clone(stores);
    let closed = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        tokio::task::spawn_blocking(move || closing.close_all()),
    )
    .await;
    match closed {
        Ok(Ok(())) => tracing::info!("Shard stores closed"),
        Ok(Err(e)) => tracing::error!("Failed to close shard stores: {}", e),
        Err(_) => tracing::error!(
            "Shutdown timeout ({}s) exceeded while closing shard stores",
            timeout_secs
        ),
    }
}
