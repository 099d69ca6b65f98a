//! Work queue with visibility delay.
//!
//! The queue carries invocation ids only; the result store holds the
//! invocation itself. An entry is invisible until its `visible_at` instant,
//! which is how delayed submissions wait without blocking anything.
//! Delivery is at-least-once: the same id may come out twice, and the claim
//! in the result store decides who runs it. An id is queued at most once at
//! a time; enqueueing it again moves it to the new `visible_at`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Instrument;

use super::invocation::InvocationId;
use crate::error::{CadenceError, ErrorCode, Result};

/// Pops the lowest-scored member whose score is at most ARGV[1].
const POP_VISIBLE_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #items == 0 then
    return false
end
redis.call('ZREM', KEYS[1], items[1])
return items[1]
"#;

/// One queue entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueuedInvocation {
    pub id: InvocationId,
    /// Not delivered before this instant
    pub visible_at: DateTime<Utc>,
}

impl Eq for QueuedInvocation {}

impl PartialEq for QueuedInvocation {
    fn eq(&self, other: &Self) -> bool {
        self.visible_at == other.visible_at && self.id == other.id
    }
}

impl PartialOrd for QueuedInvocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedInvocation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.visible_at
            .cmp(&other.visible_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Trait for queue backends.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Add an entry, or move it if the id is already queued. Returns once the
    /// backend acknowledged it.
    async fn enqueue(&self, entry: QueuedInvocation) -> Result<()>;

    /// Remove and return the earliest entry visible at `now`.
    async fn pop_visible(&self, now: DateTime<Utc>) -> Result<Option<InvocationId>>;

    /// Entries currently queued, visible or not.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory queue backend, a min-heap keyed by `visible_at`.
///
/// `queued` holds the current `visible_at` of every queued id. Heap entries
/// left behind by a re-enqueue no longer match it and are dropped on pop.
#[derive(Clone, Default)]
pub struct InMemoryQueueBackend {
    inner: Arc<Mutex<HeapState>>,
}

#[derive(Default)]
struct HeapState {
    heap: BinaryHeap<Reverse<QueuedInvocation>>,
    queued: HashMap<InvocationId, DateTime<Utc>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue(&self, entry: QueuedInvocation) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.queued.insert(entry.id, entry.visible_at) != Some(entry.visible_at) {
            state.heap.push(Reverse(entry));
        }
        Ok(())
    }

    async fn pop_visible(&self, now: DateTime<Utc>) -> Result<Option<InvocationId>> {
        let mut state = self.inner.lock().await;
        while let Some(Reverse(head)) = state.heap.peek().copied() {
            if state.queued.get(&head.id) != Some(&head.visible_at) {
                state.heap.pop();
                continue;
            }
            if head.visible_at > now {
                return Ok(None);
            }
            state.heap.pop();
            state.queued.remove(&head.id);
            return Ok(Some(head.id));
        }
        Ok(None)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().await.queued.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed queue: a sorted set of invocation ids scored by
/// `visible_at` in epoch milliseconds.
pub struct RedisQueueBackend {
    client: redis::Client,
    queue_key: String,
    pop_script: redis::Script,
}

impl RedisQueueBackend {
    /// Connect and verify the server answers.
    pub async fn connect(url: &str, queue_key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            CadenceError::with_internal(
                ErrorCode::QueueConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let backend = Self {
            client,
            queue_key: queue_key.into(),
            pop_script: redis::Script::new(POP_VISIBLE_SCRIPT),
        };

        let mut conn = backend.get_conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        tracing::info!(queue = %backend.queue_key, "Redis queue backend connected");
        Ok(backend)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await.map_err(|e| {
            CadenceError::with_internal(
                ErrorCode::QueueConnectionFailed,
                "Failed to get Redis connection for job queue",
                e.to_string(),
            )
        })
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn enqueue(&self, entry: QueuedInvocation) -> Result<()> {
        let span = tracing::info_span!("redis_queue_enqueue", queue = %self.queue_key, invocation_id = %entry.id);
        async {
            let mut conn = self.get_conn().await?;
            let _: i64 = redis::cmd("ZADD")
                .arg(&self.queue_key)
                .arg(entry.visible_at.timestamp_millis())
                .arg(entry.id.to_string())
                .query_async(&mut conn)
                .await?;

            tracing::debug!("Invocation enqueued");
            Ok::<(), CadenceError>(())
        }
        .instrument(span)
        .await
    }

    async fn pop_visible(&self, now: DateTime<Utc>) -> Result<Option<InvocationId>> {
        let span = tracing::info_span!("redis_queue_pop", queue = %self.queue_key);
        async {
            let mut conn = self.get_conn().await?;
            let member: Option<String> = self
                .pop_script
                .key(&self.queue_key)
                .arg(now.timestamp_millis())
                .invoke_async(&mut conn)
                .await?;

            member.map(|raw| raw.parse::<InvocationId>()).transpose()
        }
        .instrument(span)
        .await
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let length: usize = redis::cmd("ZCARD")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await?;
        Ok(length)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Front end over a queue backend.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Create a new in-memory job queue.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryQueueBackend::new()))
    }

    /// Enqueue `id`, invisible until `visible_at`.
    pub async fn enqueue(&self, id: InvocationId, visible_at: DateTime<Utc>) -> Result<()> {
        self.backend.enqueue(QueuedInvocation { id, visible_at }).await
    }

    pub async fn dequeue(&self) -> Result<Option<InvocationId>> {
        self.dequeue_at(Utc::now()).await
    }

    /// Next id visible at `now`, if any.
    pub async fn dequeue_at(&self, now: DateTime<Utc>) -> Result<Option<InvocationId>> {
        self.backend.pop_visible(now).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.backend.is_empty().await
    }
}
