//! Cadence Server - Main entry point
//!
//! Runs the beat scheduler, the executor pool and the HTTP API in one process.
//! Which parts share state with other processes depends on the configured
//! storage backends.

use std::net::SocketAddr;
use std::sync::Arc;

use cadence_core::{
    api::{self, AppState},
    config::{Backend, Config},
    db::Database,
    jobs::{
        BeatConfig, BeatScheduler, Dispatcher, DispatcherConfig, DueTaskEvaluator, ExecutorPool,
        InMemoryLeaderLease, InMemoryResultStore, InMemoryScheduleStore, JobQueue, JobRegistry,
        LeaderLease, RedisLeaderLease, RedisQueueBackend, ResultStore, ScheduleStore, WorkerConfig,
    },
    observability::{self, metrics},
};

/// Storage handles selected by configuration.
struct Backends {
    schedules: Arc<dyn ScheduleStore>,
    results: Arc<dyn ResultStore>,
    queue: JobQueue,
    lease: Arc<dyn LeaderLease>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::load()?;

    observability::init("cadence-server", &config.logging)?;
    let prometheus = metrics::install_recorder()?;
    metrics::register_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        instance = %config.scheduler.instance_id,
        worker = %config.worker.name,
        "Starting Cadence Server"
    );

    let backends = connect_backends(&config).await?;
    let registry = Arc::new(JobRegistry::with_builtins());
    tracing::info!(jobs = ?registry.names(), "Job registry ready");

    let dispatcher = Dispatcher::new(
        registry.clone(),
        backends.schedules.clone(),
        backends.results.clone(),
        backends.queue.clone(),
        DispatcherConfig::from_config(&config),
    );

    // Beat: evaluator loop guarded by the leader lease
    let beat = Arc::new(BeatScheduler::new(
        BeatConfig::from_settings(&config.scheduler),
        DueTaskEvaluator::new(backends.schedules.clone()),
        dispatcher.clone(),
        backends.lease.clone(),
    ));
    let beat_handle = beat.start();

    // Executor pool
    let pool = Arc::new(ExecutorPool::new(
        WorkerConfig::from_settings(&config.worker),
        registry.clone(),
        backends.results.clone(),
        backends.queue.clone(),
    ));
    let pool_handle = pool.start();

    let app_state = AppState {
        schedules: backends.schedules,
        results: backends.results,
        dispatcher: Arc::new(dispatcher),
        registry,
        metrics: Some(prometheus),
    };
    let app = api::build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the beat first so no new work is dispatched while executors drain.
    beat_handle.stop().await;
    pool_handle.stop().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

async fn connect_backends(config: &Config) -> anyhow::Result<Backends> {
    let storage = &config.storage;
    let uses_postgres = [storage.schedules, storage.results, storage.lease].contains(&Backend::Postgres);

    let database = if uses_postgres {
        let db = Database::new(&config.database).await?;
        db.migrate().await?;
        tracing::info!("Connected to database, migrations applied");
        Some(db)
    } else {
        None
    };
    let redis_url = config.redis.url.as_deref();

    let schedules: Arc<dyn ScheduleStore> = match (storage.schedules, &database) {
        (Backend::Postgres, Some(db)) => Arc::new(db.schedule_store()),
        _ => Arc::new(InMemoryScheduleStore::new()),
    };

    let results: Arc<dyn ResultStore> = match (storage.results, &database) {
        (Backend::Postgres, Some(db)) => Arc::new(db.result_store()),
        _ => Arc::new(InMemoryResultStore::new()),
    };

    let queue = match (storage.queue, redis_url) {
        (Backend::Redis, Some(url)) => {
            JobQueue::new(Arc::new(RedisQueueBackend::connect(url, config.redis.queue_key.clone()).await?))
        }
        _ => JobQueue::in_memory(),
    };

    let lease: Arc<dyn LeaderLease> = match (storage.lease, &database, redis_url) {
        (Backend::Postgres, Some(db), _) => Arc::new(db.leader_lease()),
        (Backend::Redis, _, Some(url)) => Arc::new(RedisLeaderLease::new(url)?),
        _ => Arc::new(InMemoryLeaderLease::new()),
    };

    tracing::info!(
        schedules = ?storage.schedules,
        results = ?storage.results,
        queue = ?storage.queue,
        lease = ?storage.lease,
        "Storage backends selected"
    );

    Ok(Backends {
        schedules,
        results,
        queue,
        lease,
    })
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
