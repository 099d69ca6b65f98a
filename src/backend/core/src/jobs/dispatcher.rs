//! Dispatcher: turns due schedules and ad-hoc submissions into invocations.
//!
//! For a schedule the order of side effects is fixed:
//!
//! 1. generate the invocation id
//! 2. insert the Pending invocation into the result store
//! 3. enqueue its id (acknowledged by the backend)
//! 4. record the fire on the schedule (`last_fired_at`, run count, one-off disable)
//!
//! A crash between 3 and 4 makes the next tick fire the schedule again.
//! Firings can be duplicated this way but never lost.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

use super::invocation::{InvocationId, JobInvocation};
use super::job::BackoffStrategy;
use super::queue::JobQueue;
use super::registry::JobRegistry;
use super::results::ResultStore;
use super::schedule::ScheduleDefinition;
use super::store::ScheduleStore;
use crate::config::Config;
use crate::error::Result;
use crate::observability::metrics;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a due invocation may wait for a claim
    pub claim_window: chrono::Duration,
    /// Total tries of each store/queue operation
    pub infra_retry_attempts: u32,
    pub infra_backoff: BackoffStrategy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            claim_window: chrono::Duration::hours(1),
            infra_retry_attempts: 3,
            infra_backoff: BackoffStrategy::exponential_from(
                std::time::Duration::from_millis(200),
                std::time::Duration::from_secs(5),
            ),
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            claim_window: chrono::Duration::from_std(config.worker.claim_window)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            infra_retry_attempts: config.scheduler.infra_retry_attempts.max(1),
            infra_backoff: BackoffStrategy::exponential_from(
                config.scheduler.infra_retry_base,
                config.scheduler.infra_retry_base * 16,
            ),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    schedules: Arc<dyn ScheduleStore>,
    results: Arc<dyn ResultStore>,
    queue: JobQueue,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<JobRegistry>,
        schedules: Arc<dyn ScheduleStore>,
        results: Arc<dyn ResultStore>,
        queue: JobQueue,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            schedules,
            results,
            queue,
            config,
        }
    }

    pub async fn dispatch(&self, schedule: &ScheduleDefinition) -> Result<InvocationId> {
        self.dispatch_at(schedule, Utc::now()).await
    }

    /// Fire `schedule` at `now`.
    ///
    /// The schedule record passed in is the evaluator's snapshot: if the
    /// schedule was disabled in the meantime the dispatch still completes.
    pub async fn dispatch_at(&self, schedule: &ScheduleDefinition, now: DateTime<Utc>) -> Result<InvocationId> {
        self.registry.ensure_registered(&schedule.job_name)?;

        let id = InvocationId::new();
        let invocation = JobInvocation::pending(
            id,
            schedule.job_name.clone(),
            schedule.job_args.clone(),
            now,
            self.config.claim_window,
            now,
        )?
        .with_schedule(schedule.id);

        self.retrying("insert_invocation", || self.results.insert(invocation.clone()))
            .await?;
        self.retrying("enqueue", || self.queue.enqueue(id, now)).await?;
        self.retrying("record_fire", || {
            self.schedules.record_fire(schedule.id, now, schedule.one_off)
        })
        .await?;

        metrics::record_dispatch("schedule", &schedule.job_name);
        tracing::info!(
            schedule_id = %schedule.id,
            invocation_id = %id,
            job = %schedule.job_name,
            one_off = schedule.one_off,
            "Schedule dispatched"
        );
        Ok(id)
    }

    /// Submit for immediate execution.
    pub async fn submit(&self, job_name: &str, args: Vec<serde_json::Value>) -> Result<InvocationId> {
        let now = Utc::now();
        self.submit_delayed_at(job_name, args, now, now).await
    }

    /// Submit for execution no earlier than `eta`.
    pub async fn submit_delayed(
        &self,
        job_name: &str,
        args: Vec<serde_json::Value>,
        eta: DateTime<Utc>,
    ) -> Result<InvocationId> {
        self.submit_delayed_at(job_name, args, eta, Utc::now()).await
    }

    pub async fn submit_delayed_at(
        &self,
        job_name: &str,
        args: Vec<serde_json::Value>,
        eta: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<InvocationId> {
        self.registry.ensure_registered(job_name)?;

        let id = InvocationId::new();
        let scheduled_for = eta.max(now);
        let invocation = JobInvocation::pending(id, job_name, args, scheduled_for, self.config.claim_window, now)?;

        self.retrying("insert_invocation", || self.results.insert(invocation.clone()))
            .await?;
        self.retrying("enqueue", || self.queue.enqueue(id, scheduled_for)).await?;

        let origin = if scheduled_for > now { "delayed" } else { "adhoc" };
        metrics::record_dispatch(origin, job_name);
        tracing::info!(
            invocation_id = %id,
            job = %job_name,
            scheduled_for = %scheduled_for,
            "Invocation submitted"
        );
        Ok(id)
    }

    /// Run `op`, retrying transient infrastructure errors with backoff.
    async fn retrying<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.infra_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.config.infra_backoff.delay_for_attempt(attempt);
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    e.log();
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::invocation::InvocationState;
    use crate::jobs::results::InMemoryResultStore;
    use crate::jobs::schedule::NewSchedule;
    use crate::jobs::store::InMemoryScheduleStore;

    fn setup() -> (Dispatcher, InMemoryScheduleStore, InMemoryResultStore, JobQueue) {
        let schedules = InMemoryScheduleStore::new();
        let results = InMemoryResultStore::new();
        let queue = JobQueue::in_memory();
        let dispatcher = Dispatcher::new(
            Arc::new(JobRegistry::with_builtins()),
            Arc::new(schedules.clone()),
            Arc::new(results.clone()),
            queue.clone(),
            DispatcherConfig::default(),
        );
        (dispatcher, schedules, results, queue)
    }

    #[tokio::test]
    async fn test_dispatch_records_fire_after_enqueue() {
        let (dispatcher, schedules, results, queue) = setup();
        let schedule = schedules
            .create(NewSchedule::interval("tick", 60, "increment").one_off(), None)
            .await
            .unwrap();

        let now = Utc::now();
        let id = dispatcher.dispatch_at(&schedule, now).await.unwrap();

        let invocation = results.get(id).await.unwrap().unwrap();
        assert_eq!(invocation.state, InvocationState::Pending);
        assert_eq!(invocation.schedule_id, Some(schedule.id));
        assert_eq!(queue.dequeue_at(now).await.unwrap(), Some(id));

        let after = schedules.get(schedule.id).await.unwrap().unwrap();
        assert_eq!(after.last_fired_at, Some(now));
        assert_eq!(after.total_run_count, 1);
        assert!(!after.enabled);
    }

    #[tokio::test]
    async fn test_unknown_job_has_no_side_effects() {
        let (dispatcher, schedules, results, queue) = setup();
        let mut schedule = schedules
            .create(NewSchedule::interval("tick", 60, "increment"), None)
            .await
            .unwrap();
        schedule.job_name = "missing".into();

        let err = dispatcher.dispatch(&schedule).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownJob);
        assert!(results.is_empty());
        assert!(queue.is_empty().await.unwrap());
        assert!(schedules.get(schedule.id).await.unwrap().unwrap().last_fired_at.is_none());

        assert!(dispatcher.submit("missing", vec![]).await.is_err());
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_submit_delayed_is_invisible_until_eta() {
        let (dispatcher, _, results, queue) = setup();
        let now = Utc::now();
        let eta = now + chrono::Duration::seconds(5);

        let id = dispatcher
            .submit_delayed_at("increment", vec![serde_json::json!(1)], eta, now)
            .await
            .unwrap();

        assert_eq!(results.get(id).await.unwrap().unwrap().scheduled_for, eta);
        assert_eq!(queue.dequeue_at(now).await.unwrap(), None);
        assert_eq!(queue.dequeue_at(eta).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_submit_with_unrepresentable_deadline_is_rejected() {
        let (dispatcher, _, results, queue) = setup();
        let now = Utc::now();

        let err = dispatcher
            .submit_delayed_at("increment", vec![], DateTime::<Utc>::MAX_UTC, now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(results.is_empty());
        assert!(queue.is_empty().await.unwrap());
    }
}
