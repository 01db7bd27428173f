mod analysis;
mod config;
mod db;
mod errors;
mod llm_client;
mod models;
mod pipeline;
mod queue;
mod routes;
mod state;
mod storage;
mod store;
#[cfg(test)]
mod testing;

use anyhow::Result;
use std::net::SocketAddr;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use std::sync::Arc;

use crate::analysis::analyzer::{CvAnalyzer, LlmCvAnalyzer, StaticCvAnalyzer};
use crate::analysis::extractor::{DocumentExtractor, TextExtractor};
use crate::config::Config;
use crate::db::create_pool;
use crate::llm_client::LlmClient;
use crate::pipeline::{Dispatcher, ProcessingRoutine, QuotaTracker};
use crate::queue::{
    BrokerMonitor, BrokerProbe, JobQueue, RedisJobQueue, RetryPolicy, WorkerPool,
    WorkerPoolConfig,
};
use crate::routes::build_router;
use crate::state::AppState;
use crate::storage::{ArtifactStore, RemoteStorage, S3Storage};
use crate::store::{AnalysisStore, PgAnalysisStore, PgUserStore, UserStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting CV Analyzer API v{}", env!("CARGO_PKG_VERSION"));
    if config.job_lease <= config.timeouts.attempt_budget() {
        warn!(
            "JOB_LEASE_SECS ({}s) does not exceed the step timeouts ({}s); slow attempts may be redelivered while still running",
            config.job_lease.as_secs(),
            config.timeouts.attempt_budget().as_secs()
        );
    }

    // Initialize PostgreSQL (runs pending migrations)
    let db = create_pool(&config.database_url).await?;
    let records: Arc<dyn AnalysisStore> = Arc::new(PgAnalysisStore::new(db.clone()));
    let users: Arc<dyn UserStore> = Arc::new(PgUserStore::new(db));

    // Initialize Redis queue and broker monitor
    let redis = redis::Client::open(config.redis_url.clone())?;
    let redis_queue = Arc::new(RedisJobQueue::new(
        redis,
        RetryPolicy::default(),
        config.job_lease,
    ));
    let queue: Arc<dyn JobQueue> = redis_queue.clone();
    let probe: Arc<dyn BrokerProbe> = redis_queue;

    let monitor = Arc::new(BrokerMonitor::new(false));
    if monitor.probe(probe.as_ref()).await {
        info!("Redis reachable at startup");
    } else {
        warn!("Redis unreachable at startup; uploads will be processed inline");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_task = monitor.clone().spawn(
        probe,
        config.broker_probe_interval,
        shutdown_rx.clone(),
    );

    // Initialize remote storage (S3 / MinIO) when fully configured
    let remote: Option<Arc<dyn RemoteStorage>> = match &config.remote_storage {
        Some(settings) => Some(Arc::new(S3Storage::connect(settings).await)),
        None => {
            info!("Remote storage not configured; artifacts stay on local disk");
            None
        }
    };
    let artifacts = ArtifactStore::new(
        config.upload_dir.clone(),
        config.max_upload_bytes,
        remote,
    );

    // Initialize analysis collaborators
    let analyzer: Arc<dyn CvAnalyzer> = match &config.anthropic_api_key {
        Some(key) => {
            let llm = LlmClient::new(key.clone())?;
            info!("LLM client initialized (model: {})", llm_client::MODEL);
            Arc::new(LlmCvAnalyzer(llm))
        }
        None => {
            warn!("ANTHROPIC_API_KEY not set; using the static demonstration analyzer");
            Arc::new(StaticCvAnalyzer)
        }
    };
    let extractor: Arc<dyn TextExtractor> = Arc::new(DocumentExtractor);

    // Build the pipeline
    let routine = Arc::new(ProcessingRoutine::new(
        records.clone(),
        QuotaTracker::new(users.clone()),
        extractor.clone(),
        analyzer.clone(),
        artifacts.clone(),
        config.timeouts,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        QuotaTracker::new(users),
        records.clone(),
        artifacts.clone(),
        monitor.clone(),
        routine.clone(),
        queue.clone(),
    ));

    let workers = if config.worker_enabled {
        let pool = Arc::new(WorkerPool::new(
            queue,
            routine,
            WorkerPoolConfig {
                concurrency: config.worker_concurrency,
                ..WorkerPoolConfig::default()
            },
        ));
        pool.start(shutdown_rx.clone()).await
    } else {
        info!("Embedded worker pool disabled");
        Vec::new()
    };

    // Build app state
    let state = AppState {
        records,
        artifacts,
        extractor,
        analyzer,
        dispatcher,
        monitor,
        timeouts: config.timeouts,
    };

    // Build router
    let app = build_router(state, config.max_upload_bytes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background tasks; workers finish their current job first
    info!("Shutting down background workers");
    shutdown_tx.send(true).ok();
    for handle in workers {
        if let Err(e) = handle.await {
            warn!("Worker task ended abnormally: {e}");
        }
    }
    if let Err(e) = monitor_task.await {
        warn!("Broker monitor ended abnormally: {e}");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
