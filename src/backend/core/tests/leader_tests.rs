//! Leader election between beat scheduler instances.
//!
//! Tests cover:
//! - A single leader among concurrently ticking instances
//! - Lease renewal by the current leader
//! - Failover once a leader stops renewing
//! - Release on graceful stop handing leadership over immediately

use cadence_core::jobs::{
    BeatConfig, BeatScheduler, Dispatcher, DispatcherConfig, DueTaskEvaluator, InMemoryLeaderLease,
    InMemoryResultStore, InMemoryScheduleStore, JobQueue, JobRegistry, LeaderLease, NewSchedule,
    ScheduleStore,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const RESOURCE: &str = "cadence:beat:test";

// ============================================================================
// Helpers
// ============================================================================

struct Cluster {
    schedules: InMemoryScheduleStore,
    queue: JobQueue,
    lease: InMemoryLeaderLease,
}

impl Cluster {
    fn new() -> Self {
        Self {
            schedules: InMemoryScheduleStore::new(),
            queue: JobQueue::in_memory(),
            lease: InMemoryLeaderLease::new(),
        }
    }

    fn instance(&self, id: &str, lease_ttl: Duration) -> BeatScheduler {
        let dispatcher = Dispatcher::new(
            Arc::new(JobRegistry::with_builtins()),
            Arc::new(self.schedules.clone()),
            Arc::new(InMemoryResultStore::new()),
            self.queue.clone(),
            DispatcherConfig::default(),
        );
        BeatScheduler::new(
            BeatConfig {
                tick_interval: Duration::from_millis(10),
                lease_ttl,
                resource: RESOURCE.to_string(),
                instance_id: id.to_string(),
            },
            DueTaskEvaluator::new(Arc::new(self.schedules.clone())),
            dispatcher,
            Arc::new(self.lease.clone()),
        )
    }
}

// ============================================================================
// Election
// ============================================================================

#[tokio::test]
async fn test_single_leader_among_concurrent_instances() {
    let cluster = Cluster::new();
    cluster
        .schedules
        .create(NewSchedule::interval("heartbeat", 60, "increment"), None)
        .await
        .unwrap();

    let instances: Vec<Arc<BeatScheduler>> = (0..8)
        .map(|i| Arc::new(cluster.instance(&format!("beat-{}", i), Duration::from_secs(30))))
        .collect();

    let now = Utc::now();
    let mut tasks = Vec::new();
    for instance in &instances {
        let instance = instance.clone();
        tasks.push(tokio::spawn(async move { instance.tick_at(now).await.unwrap() }));
    }

    let mut leaders = 0;
    let mut dispatched = 0;
    for task in tasks {
        let report = task.await.unwrap();
        if report.leader {
            leaders += 1;
        }
        dispatched += report.dispatched.len();
    }

    assert_eq!(leaders, 1);
    assert_eq!(dispatched, 1);
    assert_eq!(cluster.queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_leader_keeps_lease_across_ticks() {
    let cluster = Cluster::new();
    let a = cluster.instance("a", Duration::from_millis(200));
    let b = cluster.instance("b", Duration::from_millis(200));

    for _ in 0..5 {
        assert!(a.tick().await.unwrap().leader);
        assert!(!b.tick().await.unwrap().leader);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let holder = cluster.lease.current(RESOURCE).await.unwrap().unwrap();
    assert_eq!(holder.holder, "a");
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_failover_after_leader_stops_renewing() {
    let cluster = Cluster::new();
    let a = cluster.instance("a", Duration::from_millis(50));
    let b = cluster.instance("b", Duration::from_millis(50));

    assert!(a.tick().await.unwrap().leader);
    assert!(!b.tick().await.unwrap().leader);

    // `a` crashes: no release, no renewal.
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(b.tick().await.unwrap().leader);
    assert!(!a.tick().await.unwrap().leader);
}

#[tokio::test]
async fn test_graceful_stop_hands_over_immediately() {
    let cluster = Cluster::new();
    let a = Arc::new(cluster.instance("a", Duration::from_secs(30)));
    let b = cluster.instance("b", Duration::from_secs(30));

    let handle = a.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!b.tick().await.unwrap().leader);

    handle.stop().await;
    assert!(b.tick().await.unwrap().leader);
}

#[tokio::test]
async fn test_follower_does_not_touch_schedules() {
    let cluster = Cluster::new();
    let schedule = cluster
        .schedules
        .create(NewSchedule::interval("heartbeat", 1, "increment"), None)
        .await
        .unwrap();
    cluster
        .lease
        .try_acquire(RESOURCE, "someone-else", Duration::from_secs(30))
        .await
        .unwrap();

    let follower = cluster.instance("follower", Duration::from_secs(30));
    let report = follower.tick().await.unwrap();

    assert!(!report.leader);
    let stored = cluster.schedules.get(schedule.id).await.unwrap().unwrap();
    assert!(stored.last_fired_at.is_none());
    assert!(cluster.queue.is_empty().await.unwrap());
}
