//! PostgreSQL leader lease.
//!
//! Expiry is judged against the database clock, not the caller's.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;

use crate::error::Result;
use crate::jobs::leader::{LeaderLease, LeaseRecord};

#[derive(Clone)]
pub struct PgLeaderLease {
    pool: PgPool,
}

impl PgLeaderLease {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaderLease for PgLeaderLease {
    async fn try_acquire(&self, resource: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let granted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO leader_leases (resource, holder, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 millisecond'))
            ON CONFLICT (resource) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE leader_leases.holder = EXCLUDED.holder OR leader_leases.expires_at <= NOW()
            RETURNING holder
            "#,
        )
        .bind(resource)
        .bind(holder)
        .bind(ttl.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(granted.is_some())
    }

    async fn release(&self, resource: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM leader_leases WHERE resource = $1 AND holder = $2")
            .bind(resource)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn current(&self, resource: &str) -> Result<Option<LeaseRecord>> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT holder, expires_at FROM leader_leases WHERE resource = $1 AND expires_at > NOW()",
        )
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(holder, expires_at)| LeaseRecord {
            resource: resource.to_string(),
            holder,
            expires_at,
        }))
    }
}
