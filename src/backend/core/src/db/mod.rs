//! Database layer for Cadence.
//!
//! Uses PostgreSQL for persistent storage with sqlx. Each store implements
//! the same trait as its in-memory counterpart in [`crate::jobs`].

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::DatabaseConfig;
use crate::error::{CadenceError, ErrorCode, Result};

mod lease;
mod results;
mod schedules;

pub use lease::PgLeaderLease;
pub use results::PgResultStore;
pub use schedules::PgScheduleStore;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            CadenceError::new(ErrorCode::MissingConfiguration, "database.url is not set")
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await?;

        tracing::info!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CadenceError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn schedule_store(&self) -> PgScheduleStore {
        PgScheduleStore::new(self.pool.clone())
    }

    pub fn result_store(&self) -> PgResultStore {
        PgResultStore::new(self.pool.clone())
    }

    pub fn leader_lease(&self) -> PgLeaderLease {
        PgLeaderLease::new(self.pool.clone())
    }
}
