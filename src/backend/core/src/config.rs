//! Configuration management.
//!
//! Values are layered: serde defaults, then an optional file (`CADENCE_CONFIG`
//! or [`Config::from_file`]), then `CADENCE__SECTION__KEY` environment variables.
//! Durations use humantime notation (`"500ms"`, `"30s"`, `"5m"`).

use serde::Deserialize;
use std::time::Duration;

use crate::error::{CadenceError, Result};
use crate::observability::LogFormat;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    /// Which backend carries each store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Evaluator loop and leader lease
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Executor pool
    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; required when any store uses postgres
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL; required when the queue or lease uses redis
    pub url: Option<String>,

    /// Sorted-set key holding queued invocation ids
    #[serde(default = "default_queue_key")]
    pub queue_key: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            queue_key: default_queue_key(),
        }
    }
}

/// Backend selector for a store.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Postgres,
    Redis,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// memory | postgres
    #[serde(default)]
    pub schedules: Backend,

    /// memory | postgres
    #[serde(default)]
    pub results: Backend,

    /// memory | redis
    #[serde(default)]
    pub queue: Backend,

    /// memory | redis | postgres
    #[serde(default)]
    pub lease: Backend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// How often the evaluator polls the schedule store
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Time-to-live of the leader lease; renewed every tick
    #[serde(default = "default_lease_ttl", with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// Fixed resource name the leader lease is keyed by
    #[serde(default = "default_leader_resource")]
    pub leader_resource: String,

    /// Identity of this process when holding the lease
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Attempts for store/queue operations inside the dispatcher
    #[serde(default = "default_infra_retry_attempts")]
    pub infra_retry_attempts: u32,

    #[serde(default = "default_infra_retry_base", with = "humantime_serde")]
    pub infra_retry_base: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            lease_ttl: default_lease_ttl(),
            leader_resource: default_leader_resource(),
            instance_id: default_instance_id(),
            infra_retry_attempts: default_infra_retry_attempts(),
            infra_retry_base: default_infra_retry_base(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// Maximum concurrent job executions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Queue poll interval when idle
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long a claim stays valid before another executor may reclaim it
    #[serde(default = "default_visibility_timeout", with = "humantime_serde")]
    pub visibility_timeout: Duration,

    /// How long a due invocation may wait unclaimed before it expires
    #[serde(default = "default_claim_window", with = "humantime_serde")]
    pub claim_window: Duration,

    /// Interval of the reclaim/expiry sweep
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            visibility_timeout: default_visibility_timeout(),
            claim_window: default_claim_window(),
            sweep_interval: default_sweep_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Upper bound for the worker lease and claim window.
const MAX_WORKER_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 5 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_queue_key() -> String { "cadence:queue:invocations".to_string() }
fn default_tick_interval() -> Duration { Duration::from_secs(1) }
fn default_lease_ttl() -> Duration { Duration::from_secs(15) }
fn default_leader_resource() -> String { "cadence:beat:leader".to_string() }
fn default_instance_id() -> String { format!("cadence-{}", uuid::Uuid::new_v4()) }
fn default_infra_retry_attempts() -> u32 { 3 }
fn default_infra_retry_base() -> Duration { Duration::from_millis(200) }
fn default_worker_name() -> String { format!("cadence-worker-{}", uuid::Uuid::new_v4().simple()) }
fn default_concurrency() -> usize { 4 }
fn default_poll_interval() -> Duration { Duration::from_millis(500) }
fn default_visibility_timeout() -> Duration { Duration::from_secs(300) }
fn default_claim_window() -> Duration { Duration::from_secs(3600) }
fn default_sweep_interval() -> Duration { Duration::from_secs(10) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_log_level() -> String { "info".to_string() }

impl Config {
    /// Load configuration from the environment, plus `CADENCE_CONFIG` if set.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("CADENCE_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("CADENCE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CADENCE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(CadenceError::configuration("worker.concurrency must be at least 1"));
        }
        if self.scheduler.tick_interval.is_zero() {
            return Err(CadenceError::configuration("scheduler.tick_interval must be positive"));
        }
        if self.worker.visibility_timeout.is_zero() || self.worker.visibility_timeout > MAX_WORKER_WINDOW {
            return Err(CadenceError::configuration(
                "worker.visibility_timeout must be positive and at most 30 days",
            ));
        }
        if self.worker.claim_window.is_zero() || self.worker.claim_window > MAX_WORKER_WINDOW {
            return Err(CadenceError::configuration(
                "worker.claim_window must be positive and at most 30 days",
            ));
        }
        if self.scheduler.lease_ttl <= self.scheduler.tick_interval {
            return Err(CadenceError::configuration(
                "scheduler.lease_ttl must be longer than scheduler.tick_interval",
            ));
        }

        let needs_postgres = [self.storage.schedules, self.storage.results, self.storage.lease]
            .contains(&Backend::Postgres);
        if needs_postgres && self.database.url.is_none() {
            return Err(CadenceError::configuration(
                "database.url is required when a store uses postgres",
            ));
        }

        let needs_redis = [self.storage.queue, self.storage.lease].contains(&Backend::Redis);
        if needs_redis && self.redis.url.is_none() {
            return Err(CadenceError::configuration(
                "redis.url is required when the queue or lease uses redis",
            ));
        }

        if self.storage.schedules == Backend::Redis || self.storage.results == Backend::Redis {
            return Err(CadenceError::configuration(
                "schedule and result stores support memory or postgres only",
            ));
        }
        if self.storage.queue == Backend::Postgres {
            return Err(CadenceError::configuration("queue supports memory or redis only"));
        }

        Ok(())
    }
}
