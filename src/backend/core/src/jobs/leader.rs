//! Lease-based leader lock.
//!
//! Only the holder of the lease on a fixed resource name may run the
//! evaluator loop. A lease is granted when the resource is free, when the
//! previous lease expired, or when the caller already holds it (a renewal).
//! A crashed leader is replaced once its TTL runs out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CadenceError, ErrorCode, Result};

const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Current holder of a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub resource: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Acquire or renew the lease on `resource` for `holder`.
    async fn try_acquire(&self, resource: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Give the lease up early. Only the holder can release; returns whether
    /// anything was released.
    async fn release(&self, resource: &str, holder: &str) -> Result<bool>;

    async fn current(&self, resource: &str) -> Result<Option<LeaseRecord>>;
}

fn ttl_to_chrono(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|_| CadenceError::new(ErrorCode::InvalidConfiguration, "Lease TTL out of range"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Lease
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local lease table. Shared by cloning.
#[derive(Clone, Default)]
pub struct InMemoryLeaderLease {
    leases: Arc<Mutex<HashMap<String, LeaseRecord>>>,
}

impl InMemoryLeaderLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire_at(&self, resource: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        let expires_at = now + ttl_to_chrono(ttl)?;
        let mut leases = self.leases.lock();

        let available = match leases.get(resource) {
            None => true,
            Some(lease) => lease.holder == holder || lease.is_expired(now),
        };
        if available {
            leases.insert(
                resource.to_string(),
                LeaseRecord {
                    resource: resource.to_string(),
                    holder: holder.to_string(),
                    expires_at,
                },
            );
        }
        Ok(available)
    }
}

#[async_trait]
impl LeaderLease for InMemoryLeaderLease {
    async fn try_acquire(&self, resource: &str, holder: &str, ttl: Duration) -> Result<bool> {
        self.try_acquire_at(resource, holder, ttl, Utc::now())
    }

    async fn release(&self, resource: &str, holder: &str) -> Result<bool> {
        let mut leases = self.leases.lock();
        match leases.get(resource) {
            Some(lease) if lease.holder == holder => {
                leases.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current(&self, resource: &str) -> Result<Option<LeaseRecord>> {
        let now = Utc::now();
        Ok(self
            .leases
            .lock()
            .get(resource)
            .filter(|lease| !lease.is_expired(now))
            .cloned())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Lease
// ═══════════════════════════════════════════════════════════════════════════════

/// Lease stored as a Redis key holding the holder id, expiring via `PX`.
pub struct RedisLeaderLease {
    client: redis::Client,
    acquire: redis::Script,
    release: redis::Script,
}

impl RedisLeaderLease {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            CadenceError::with_internal(
                ErrorCode::QueueConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;
        Ok(Self {
            client,
            acquire: redis::Script::new(ACQUIRE_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl LeaderLease for RedisLeaderLease {
    async fn try_acquire(&self, resource: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let acquired: i64 = self
            .acquire
            .key(resource)
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release(&self, resource: &str, holder: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let released: i64 = self
            .release
            .key(resource)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn current(&self, resource: &str) -> Result<Option<LeaseRecord>> {
        let mut conn = self.get_conn().await?;
        let (holder, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(resource)
            .cmd("PTTL")
            .arg(resource)
            .query_async(&mut conn)
            .await?;

        Ok(holder.filter(|_| pttl > 0).map(|holder| LeaseRecord {
            resource: resource.to_string(),
            holder,
            expires_at: Utc::now() + chrono::Duration::milliseconds(pttl),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESOURCE: &str = "cadence:beat:leader";

    #[test]
    fn test_only_one_holder() {
        let lease = InMemoryLeaderLease::new();
        let now = Utc::now();
        let ttl = Duration::from_secs(10);

        assert!(lease.try_acquire_at(RESOURCE, "a", ttl, now).unwrap());
        assert!(!lease.try_acquire_at(RESOURCE, "b", ttl, now).unwrap());
        // Renewal by the holder.
        assert!(lease.try_acquire_at(RESOURCE, "a", ttl, now + chrono::Duration::seconds(5)).unwrap());
        assert!(!lease.try_acquire_at(RESOURCE, "b", ttl, now + chrono::Duration::seconds(12)).unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken() {
        let lease = InMemoryLeaderLease::new();
        let now = Utc::now();
        let ttl = Duration::from_secs(10);

        assert!(lease.try_acquire_at(RESOURCE, "a", ttl, now).unwrap());
        assert!(lease.try_acquire_at(RESOURCE, "b", ttl, now + chrono::Duration::seconds(10)).unwrap());
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let lease = InMemoryLeaderLease::new();
        assert!(lease.try_acquire(RESOURCE, "a", Duration::from_secs(10)).await.unwrap());

        assert!(!lease.release(RESOURCE, "b").await.unwrap());
        assert_eq!(lease.current(RESOURCE).await.unwrap().unwrap().holder, "a");

        assert!(lease.release(RESOURCE, "a").await.unwrap());
        assert!(lease.current(RESOURCE).await.unwrap().is_none());
        assert!(lease.try_acquire(RESOURCE, "b", Duration::from_secs(10)).await.unwrap());
    }
}
