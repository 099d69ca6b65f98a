//! Beat scheduler: the periodic loop that fires due schedules.
//!
//! Every tick the scheduler first acquires (or renews) the leader lease. Only
//! the leader evaluates schedules; followers skip the tick and try again on
//! the next one. A failure dispatching one schedule is logged and does not
//! stop the others.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::dispatcher::Dispatcher;
use super::evaluator::DueTaskEvaluator;
use super::invocation::InvocationId;
use super::leader::LeaderLease;
use super::schedule::ScheduleId;
use crate::config::SchedulerSettings;
use crate::error::Result;
use crate::observability::metrics;

/// Beat loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatConfig {
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// Lease resource shared by all scheduler instances
    pub resource: String,
    /// This instance's lease holder id
    pub instance_id: String,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
            resource: "cadence:beat:leader".to_string(),
            instance_id: format!("beat-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl BeatConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            tick_interval: settings.tick_interval,
            lease_ttl: settings.lease_ttl,
            resource: settings.leader_resource.clone(),
            instance_id: settings.instance_id.clone(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Whether this instance held the lease for the tick
    pub leader: bool,
    pub dispatched: Vec<(ScheduleId, InvocationId)>,
    pub failed: Vec<(ScheduleId, String)>,
}

impl TickReport {
    fn follower() -> Self {
        Self::default()
    }
}

/// Handle for a running beat loop.
pub struct BeatHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BeatHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for the loop to release its lease.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Beat task ended abnormally");
        }
    }
}

pub struct BeatScheduler {
    config: BeatConfig,
    evaluator: DueTaskEvaluator,
    dispatcher: Dispatcher,
    lease: Arc<dyn LeaderLease>,
    shutdown: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl BeatScheduler {
    pub fn new(
        config: BeatConfig,
        evaluator: DueTaskEvaluator,
        dispatcher: Dispatcher,
        lease: Arc<dyn LeaderLease>,
    ) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            config,
            evaluator,
            dispatcher,
            lease,
            shutdown,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &BeatConfig {
        &self.config
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one evaluation at `now` if this instance holds the lease.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let leader = self
            .lease
            .try_acquire(&self.config.resource, &self.config.instance_id, self.config.lease_ttl)
            .await?;
        metrics::record_tick(leader);

        if !leader {
            tracing::debug!(instance = %self.config.instance_id, "Not the leader, skipping tick");
            return Ok(TickReport::follower());
        }

        let due = self.evaluator.poll(now).await?;
        let mut report = TickReport {
            leader: true,
            ..TickReport::default()
        };

        for schedule in &due {
            match self.dispatcher.dispatch_at(schedule, now).await {
                Ok(id) => report.dispatched.push((schedule.id, id)),
                Err(e) => {
                    tracing::error!(
                        schedule_id = %schedule.id,
                        name = %schedule.name,
                        error = %e,
                        "Failed to dispatch schedule"
                    );
                    report.failed.push((schedule.id, e.to_string()));
                }
            }
        }

        if !due.is_empty() {
            tracing::info!(
                due = due.len(),
                dispatched = report.dispatched.len(),
                failed = report.failed.len(),
                "Tick complete"
            );
        }
        Ok(report)
    }

    /// Spawn the tick loop.
    pub fn start(self: Arc<Self>) -> BeatHandle {
        let shutdown = self.shutdown_tx.clone();
        let task = tokio::spawn(self.run());
        BeatHandle { shutdown, task }
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.clone();
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            instance = %self.config.instance_id,
            tick_interval = ?self.config.tick_interval,
            "Beat scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        e.log();
                    }
                }
            }
        }

        match self
            .lease
            .release(&self.config.resource, &self.config.instance_id)
            .await
        {
            Ok(true) => tracing::info!(instance = %self.config.instance_id, "Leader lease released"),
            Ok(false) => {}
            Err(e) => e.log(),
        }
        tracing::info!(instance = %self.config.instance_id, "Beat scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::dispatcher::DispatcherConfig;
    use crate::jobs::leader::InMemoryLeaderLease;
    use crate::jobs::queue::JobQueue;
    use crate::jobs::registry::JobRegistry;
    use crate::jobs::results::InMemoryResultStore;
    use crate::jobs::schedule::NewSchedule;
    use crate::jobs::store::{InMemoryScheduleStore, ScheduleStore};

    fn beat(
        instance: &str,
        schedules: &InMemoryScheduleStore,
        queue: &JobQueue,
        lease: &InMemoryLeaderLease,
    ) -> BeatScheduler {
        let dispatcher = Dispatcher::new(
            Arc::new(JobRegistry::with_builtins()),
            Arc::new(schedules.clone()),
            Arc::new(InMemoryResultStore::new()),
            queue.clone(),
            DispatcherConfig::default(),
        );
        BeatScheduler::new(
            BeatConfig {
                instance_id: instance.to_string(),
                ..BeatConfig::default()
            },
            DueTaskEvaluator::new(Arc::new(schedules.clone())),
            dispatcher,
            Arc::new(lease.clone()),
        )
    }

    #[tokio::test]
    async fn test_only_leader_dispatches() {
        let schedules = InMemoryScheduleStore::new();
        let queue = JobQueue::in_memory();
        let lease = InMemoryLeaderLease::new();
        schedules
            .create(NewSchedule::interval("every-minute", 60, "increment"), None)
            .await
            .unwrap();

        let a = beat("a", &schedules, &queue, &lease);
        let b = beat("b", &schedules, &queue, &lease);
        let now = Utc::now();

        let first = a.tick_at(now).await.unwrap();
        assert!(first.leader);
        assert_eq!(first.dispatched.len(), 1);

        let second = b.tick_at(now + chrono::Duration::seconds(120)).await.unwrap();
        assert!(!second.leader);
        assert!(second.dispatched.is_empty());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tick_is_idempotent_within_interval() {
        let schedules = InMemoryScheduleStore::new();
        let queue = JobQueue::in_memory();
        let lease = InMemoryLeaderLease::new();
        schedules
            .create(NewSchedule::interval("every-minute", 60, "increment"), None)
            .await
            .unwrap();

        let a = beat("a", &schedules, &queue, &lease);
        let now = Utc::now();
        assert_eq!(a.tick_at(now).await.unwrap().dispatched.len(), 1);
        assert!(a.tick_at(now + chrono::Duration::seconds(30)).await.unwrap().dispatched.is_empty());
        assert_eq!(a.tick_at(now + chrono::Duration::seconds(60)).await.unwrap().dispatched.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_releases_lease() {
        let schedules = InMemoryScheduleStore::new();
        let queue = JobQueue::in_memory();
        let lease = InMemoryLeaderLease::new();

        let handle = Arc::new(beat("a", &schedules, &queue, &lease)).start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lease.current("cadence:beat:leader").await.unwrap().unwrap().holder, "a");

        handle.stop().await;
        assert!(lease.current("cadence:beat:leader").await.unwrap().is_none());
    }
}
