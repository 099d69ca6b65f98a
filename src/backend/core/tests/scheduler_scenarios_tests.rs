//! End-to-end scheduling scenarios over the in-memory backends.
//!
//! Tests cover:
//! - Interval schedule fired on the first tick and executed to a stored result
//! - Delayed submission invisible until its eta
//! - Crontab firing at most once per matching minute
//! - No catch-up after missed ticks
//! - Evaluator idempotence on the same instant
//! - At-least-once dispatch when the schedule update fails after enqueue
//! - Infrastructure failures leaving the schedule untouched
//! - One-off schedules and activity windows

use async_trait::async_trait;
use cadence_core::error::{CadenceError, ErrorCode, Result};
use cadence_core::jobs::{
    BeatConfig, BeatScheduler, BackoffStrategy, CrontabFields, Dispatcher, DispatcherConfig,
    DueTaskEvaluator, ExecutorPool, InMemoryLeaderLease, InMemoryQueueBackend, InMemoryResultStore,
    InMemoryScheduleStore, InvocationId, InvocationState, JobQueue, JobRegistry, NewSchedule,
    QueueBackend, QueuedInvocation, ResultStore, ScheduleDefinition, ScheduleId, SchedulePatch,
    ScheduleStore, WorkerConfig,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    schedules: InMemoryScheduleStore,
    results: InMemoryResultStore,
    queue: JobQueue,
    dispatcher: Dispatcher,
    beat: BeatScheduler,
    pool: ExecutorPool,
}

fn fast_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        infra_retry_attempts: 3,
        infra_backoff: BackoffStrategy::fixed(std::time::Duration::from_millis(1)),
        ..DispatcherConfig::default()
    }
}

fn harness_with(schedules: Arc<dyn ScheduleStore>, store: InMemoryScheduleStore, queue: JobQueue) -> Harness {
    let results = InMemoryResultStore::new();
    let registry = Arc::new(JobRegistry::with_builtins());
    let dispatcher = Dispatcher::new(
        registry.clone(),
        schedules.clone(),
        Arc::new(results.clone()),
        queue.clone(),
        fast_dispatcher_config(),
    );
    let beat = BeatScheduler::new(
        BeatConfig {
            instance_id: "beat-test".to_string(),
            ..BeatConfig::default()
        },
        DueTaskEvaluator::new(schedules),
        dispatcher.clone(),
        Arc::new(InMemoryLeaderLease::new()),
    );
    let pool = ExecutorPool::new(
        WorkerConfig {
            name: "worker-test".to_string(),
            ..WorkerConfig::default()
        },
        registry,
        Arc::new(results.clone()),
        queue.clone(),
    );

    Harness {
        schedules: store,
        results,
        queue,
        dispatcher,
        beat,
        pool,
    }
}

fn harness() -> Harness {
    let store = InMemoryScheduleStore::new();
    harness_with(Arc::new(store.clone()), store, JobQueue::in_memory())
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
}

// ============================================================================
// Interval Scenario
// ============================================================================

#[tokio::test]
async fn test_interval_schedule_fires_and_stores_result() {
    let h = harness();
    let schedule = h
        .schedules
        .create(NewSchedule::interval("bump", 60, "increment").with_args(vec![json!(1)]), None)
        .await
        .unwrap();

    let report = h.beat.tick_at(t0()).await.unwrap();
    assert!(report.leader);
    assert_eq!(report.dispatched.len(), 1);
    let (fired, invocation_id) = report.dispatched[0];
    assert_eq!(fired, schedule.id);

    let finished = h.pool.poll_once_at(t0()).await.unwrap().unwrap();
    assert_eq!(finished.id, invocation_id);
    assert_eq!(finished.state, InvocationState::Succeeded);
    assert_eq!(finished.result, Some(json!(2)));

    let stored = h.results.get(invocation_id).await.unwrap().unwrap();
    assert_eq!(stored.state, InvocationState::Succeeded);
    assert_eq!(stored.result, Some(json!(2)));
    assert_eq!(stored.schedule_id, Some(schedule.id));
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn test_interval_schedule_refires_after_interval() {
    let h = harness();
    h.schedules
        .create(NewSchedule::interval("bump", 60, "increment").with_args(vec![json!(1)]), None)
        .await
        .unwrap();

    assert_eq!(h.beat.tick_at(t0()).await.unwrap().dispatched.len(), 1);
    assert!(h.beat.tick_at(t0() + Duration::seconds(59)).await.unwrap().dispatched.is_empty());
    assert_eq!(h.beat.tick_at(t0() + Duration::seconds(60)).await.unwrap().dispatched.len(), 1);
    assert_eq!(h.queue.len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_missed_ticks_fire_once() {
    let h = harness();
    let schedule = h
        .schedules
        .create(NewSchedule::interval("bump", 60, "increment").with_args(vec![json!(1)]), None)
        .await
        .unwrap();

    h.beat.tick_at(t0()).await.unwrap();
    // Evaluator was down for ten intervals.
    let resumed = t0() + Duration::minutes(10);
    assert_eq!(h.beat.tick_at(resumed).await.unwrap().dispatched.len(), 1);
    assert!(h.beat.tick_at(resumed + Duration::seconds(1)).await.unwrap().dispatched.is_empty());

    let stored = h.schedules.get(schedule.id).await.unwrap().unwrap();
    assert_eq!(stored.total_run_count, 2);
    assert_eq!(stored.last_fired_at, Some(resumed));
}

// ============================================================================
// Delayed Submission Scenario
// ============================================================================

#[tokio::test]
async fn test_delayed_submission_pending_until_eta() {
    let h = harness();
    let eta = t0() + Duration::seconds(5);

    let id = h
        .dispatcher
        .submit_delayed_at("increment", vec![json!(41)], eta, t0())
        .await
        .unwrap();

    assert!(h.pool.poll_once_at(t0() + Duration::seconds(4)).await.unwrap().is_none());
    assert_eq!(h.results.get(id).await.unwrap().unwrap().state, InvocationState::Pending);

    let finished = h.pool.poll_once_at(eta).await.unwrap().unwrap();
    assert_eq!(finished.id, id);
    assert_eq!(finished.state, InvocationState::Succeeded);
    assert_eq!(h.results.get(id).await.unwrap().unwrap().result, Some(json!(42)));
}

#[tokio::test]
async fn test_eta_in_the_past_runs_immediately() {
    let h = harness();
    let id = h
        .dispatcher
        .submit_delayed_at("increment", vec![json!(1)], t0() - Duration::hours(1), t0())
        .await
        .unwrap();

    let invocation = h.results.get(id).await.unwrap().unwrap();
    assert_eq!(invocation.scheduled_for, t0());
    assert_eq!(h.pool.poll_once_at(t0()).await.unwrap().unwrap().state, InvocationState::Succeeded);
}

// ============================================================================
// Crontab Scenario
// ============================================================================

#[tokio::test]
async fn test_crontab_every_minute_fires_once_per_minute() {
    let h = harness();
    h.schedules
        .create(
            NewSchedule::crontab("minutely", CrontabFields::default().minute("*/1"), "increment")
                .with_args(vec![json!(1)]),
            None,
        )
        .await
        .unwrap();

    let fired_at_0 = h.beat.tick_at(t0()).await.unwrap();
    let fired_at_30 = h.beat.tick_at(t0() + Duration::seconds(30)).await.unwrap();
    let fired_at_60 = h.beat.tick_at(t0() + Duration::seconds(60)).await.unwrap();

    assert_eq!(fired_at_0.dispatched.len(), 1);
    assert!(fired_at_30.dispatched.is_empty());
    assert_eq!(fired_at_60.dispatched.len(), 1);
}

#[tokio::test]
async fn test_crontab_no_catch_up_after_downtime() {
    let h = harness();
    let schedule = h
        .schedules
        .create(
            NewSchedule::crontab("quarter-hourly", CrontabFields::default().minute("*/15"), "increment")
                .with_args(vec![json!(1)]),
            None,
        )
        .await
        .unwrap();

    assert_eq!(h.beat.tick_at(t0()).await.unwrap().dispatched.len(), 1);
    // Down from 00:00 to 01:07; 00:15 .. 01:00 were missed and are not replayed.
    assert!(h
        .beat
        .tick_at(t0() + Duration::minutes(67))
        .await
        .unwrap()
        .dispatched
        .is_empty());
    assert_eq!(
        h.beat
            .tick_at(t0() + Duration::minutes(75) + Duration::seconds(12))
            .await
            .unwrap()
            .dispatched
            .len(),
        1
    );
    assert_eq!(h.schedules.get(schedule.id).await.unwrap().unwrap().total_run_count, 2);
}

// ============================================================================
// Evaluator Properties
// ============================================================================

#[tokio::test]
async fn test_evaluation_is_idempotent_for_same_instant() {
    let h = harness();
    h.schedules
        .create(NewSchedule::interval("a", 60, "increment"), None)
        .await
        .unwrap();
    h.schedules
        .create(NewSchedule::crontab("b", CrontabFields::default().hour("3"), "increment"), None)
        .await
        .unwrap();

    let snapshot = h.schedules.list_enabled().await.unwrap();
    let first: Vec<ScheduleId> = DueTaskEvaluator::evaluate(&snapshot, t0()).iter().map(|s| s.id).collect();
    let second: Vec<ScheduleId> = DueTaskEvaluator::evaluate(&snapshot, t0()).iter().map(|s| s.id).collect();

    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
}

#[tokio::test]
async fn test_one_off_schedule_disables_after_dispatch() {
    let h = harness();
    let schedule = h
        .schedules
        .create(NewSchedule::interval("once", 1, "increment").with_args(vec![json!(1)]).one_off(), None)
        .await
        .unwrap();

    assert_eq!(h.beat.tick_at(t0()).await.unwrap().dispatched.len(), 1);
    assert!(h.beat.tick_at(t0() + Duration::minutes(5)).await.unwrap().dispatched.is_empty());
    assert!(!h.schedules.get(schedule.id).await.unwrap().unwrap().enabled);
}

#[tokio::test]
async fn test_activity_window_bounds_firing() {
    let h = harness();
    h.schedules
        .create(
            NewSchedule::interval("windowed", 60, "increment")
                .with_args(vec![json!(1)])
                .active_between(Some(t0() + Duration::minutes(10)), Some(t0() + Duration::minutes(20))),
            None,
        )
        .await
        .unwrap();

    assert!(h.beat.tick_at(t0()).await.unwrap().dispatched.is_empty());
    assert_eq!(h.beat.tick_at(t0() + Duration::minutes(10)).await.unwrap().dispatched.len(), 1);
    assert!(h.beat.tick_at(t0() + Duration::minutes(20)).await.unwrap().dispatched.is_empty());
}

#[tokio::test]
async fn test_snapshot_dispatch_survives_concurrent_disable() {
    let h = harness();
    let schedule = h
        .schedules
        .create(NewSchedule::interval("racy", 60, "increment").with_args(vec![json!(1)]), None)
        .await
        .unwrap();

    let snapshot: Vec<ScheduleDefinition> = DueTaskEvaluator::evaluate(&h.schedules.list_enabled().await.unwrap(), t0());
    h.schedules
        .update(
            schedule.id,
            SchedulePatch {
                enabled: Some(false),
                ..SchedulePatch::default()
            },
        )
        .await
        .unwrap();

    let id = h.dispatcher.dispatch_at(&snapshot[0], t0()).await.unwrap();
    assert_eq!(h.results.get(id).await.unwrap().unwrap().state, InvocationState::Pending);
    let stored = h.schedules.get(schedule.id).await.unwrap().unwrap();
    assert!(!stored.enabled);
    assert_eq!(stored.last_fired_at, Some(t0()));
}

// ============================================================================
// Failure Handling
// ============================================================================

/// Schedule store whose `record_fire` always fails, as if the process died
/// right after the enqueue was acknowledged.
struct CrashBeforeRecordFire {
    inner: InMemoryScheduleStore,
}

#[async_trait]
impl ScheduleStore for CrashBeforeRecordFire {
    async fn create(&self, new: NewSchedule, created_by: Option<String>) -> Result<ScheduleDefinition> {
        self.inner.create(new, created_by).await
    }

    async fn update(&self, id: ScheduleId, patch: SchedulePatch) -> Result<ScheduleDefinition> {
        self.inner.update(id, patch).await
    }

    async fn disable(&self, id: ScheduleId) -> Result<()> {
        self.inner.disable(id).await
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduleDefinition>> {
        self.inner.get(id).await
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleDefinition>> {
        self.inner.get_by_name(name).await
    }

    async fn list_enabled(&self) -> Result<Vec<ScheduleDefinition>> {
        self.inner.list_enabled().await
    }

    async fn list_all(&self) -> Result<Vec<ScheduleDefinition>> {
        self.inner.list_all().await
    }

    async fn record_fire(&self, _id: ScheduleId, _fired_at: DateTime<Utc>, _disable: bool) -> Result<()> {
        Err(CadenceError::new(ErrorCode::DatabaseConnectionFailed, "connection reset"))
    }
}

#[tokio::test]
async fn test_crash_after_enqueue_refires_instead_of_losing() {
    let store = InMemoryScheduleStore::new();
    let queue = JobQueue::in_memory();
    let crashing = harness_with(
        Arc::new(CrashBeforeRecordFire { inner: store.clone() }),
        store.clone(),
        queue.clone(),
    );
    let schedule = store
        .create(NewSchedule::interval("bump", 60, "increment").with_args(vec![json!(1)]), None)
        .await
        .unwrap();

    let report = crashing.beat.tick_at(t0()).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(queue.len().await.unwrap(), 1);
    assert!(store.get(schedule.id).await.unwrap().unwrap().last_fired_at.is_none());

    // Restarted with a healthy store: the schedule fires again.
    let restarted = harness_with(Arc::new(store.clone()), store.clone(), queue.clone());
    let report = restarted.beat.tick_at(t0() + Duration::seconds(1)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(queue.len().await.unwrap(), 2);
    assert_eq!(store.get(schedule.id).await.unwrap().unwrap().total_run_count, 1);
}

/// Queue backend failing its first `failures` enqueues.
struct FlakyQueue {
    inner: InMemoryQueueBackend,
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl QueueBackend for FlakyQueue {
    async fn enqueue(&self, entry: QueuedInvocation) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(CadenceError::new(ErrorCode::QueueConnectionFailed, "broker unavailable"));
        }
        self.inner.enqueue(entry).await
    }

    async fn pop_visible(&self, now: DateTime<Utc>) -> Result<Option<InvocationId>> {
        self.inner.pop_visible(now).await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }
}

#[tokio::test]
async fn test_transient_queue_failure_is_retried() {
    let store = InMemoryScheduleStore::new();
    let queue = JobQueue::new(Arc::new(FlakyQueue {
        inner: InMemoryQueueBackend::new(),
        failures: 2,
        calls: AtomicU32::new(0),
    }));
    let h = harness_with(Arc::new(store.clone()), store.clone(), queue);
    let schedule = store
        .create(NewSchedule::interval("bump", 60, "increment"), None)
        .await
        .unwrap();

    let report = h.beat.tick_at(t0()).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(h.queue.len().await.unwrap(), 1);
    assert_eq!(store.get(schedule.id).await.unwrap().unwrap().last_fired_at, Some(t0()));
}

#[tokio::test]
async fn test_exhausted_queue_retries_leave_schedule_unchanged() {
    let store = InMemoryScheduleStore::new();
    let queue = JobQueue::new(Arc::new(FlakyQueue {
        inner: InMemoryQueueBackend::new(),
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    }));
    let h = harness_with(Arc::new(store.clone()), store.clone(), queue);
    let schedule = store
        .create(NewSchedule::interval("bump", 60, "increment").one_off(), None)
        .await
        .unwrap();

    let report = h.beat.tick_at(t0()).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.failed.len(), 1);

    let stored = store.get(schedule.id).await.unwrap().unwrap();
    assert!(stored.enabled);
    assert!(stored.last_fired_at.is_none());
    assert_eq!(stored.total_run_count, 0);
}

#[tokio::test]
async fn test_unknown_job_rejected_before_side_effects() {
    let h = harness();
    let err = h.dispatcher.submit("no_such_job", vec![]).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::UnknownJob);
    assert!(h.results.is_empty());
    assert!(h.queue.is_empty().await.unwrap());
}
