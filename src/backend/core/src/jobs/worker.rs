//! Job executor pool.
//!
//! Each slot repeatedly pops an id from the queue, claims it in the result
//! store, runs the registered handler under its time budget and writes the
//! terminal state. A sweeper running next to the slots expires invocations
//! that were never claimed in time and re-queues claims whose lease lapsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::invocation::{ClaimToken, InvocationId, InvocationOutcome, InvocationState, JobInvocation};
use super::job::{Job, JobContext, JobError};
use super::queue::JobQueue;
use super::registry::JobRegistry;
use super::results::{ClaimOutcome, ResultStore};
use crate::config::WorkerSettings;
use crate::error::{CadenceError, ErrorCode, Result};
use crate::observability::metrics;

/// Configuration for the executor pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name recorded on claims; each claim also gets its own token
    pub name: String,
    /// Maximum concurrent job executions
    pub concurrency: usize,
    /// Idle wait between queue polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Lease granted by each claim
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// How long shutdown waits for in-flight executions
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            name: settings.name.clone(),
            concurrency: settings.concurrency.max(1),
            poll_interval: settings.poll_interval,
            visibility_timeout: settings.visibility_timeout,
            sweep_interval: settings.sweep_interval,
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.visibility_timeout).unwrap_or_else(|_| chrono::Duration::minutes(5))
    }

    /// Heartbeat period for lease renewal while a job runs.
    fn renew_every(&self) -> Duration {
        (self.visibility_timeout / 3).max(Duration::from_millis(10))
    }
}

/// Statistics for the executor pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Invocations claimed and run to a terminal state
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    /// Extra attempts made under a retry policy
    pub retried: Arc<AtomicU64>,
    /// Claims taken over from a lapsed lease
    pub reclaimed: Arc<AtomicU64>,
    /// Expired by this pool's sweeper or claims
    pub expired: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<InvocationId>,
    pub requeued: Vec<InvocationId>,
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal the pool to stop claiming new work.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for the loops to drain.
    pub async fn stop(self) {
        self.shutdown();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Executor task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Pool of executors consuming one queue.
pub struct ExecutorPool {
    config: WorkerConfig,
    registry: Arc<JobRegistry>,
    results: Arc<dyn ResultStore>,
    queue: JobQueue,
    stats: WorkerStats,
    shutdown: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl ExecutorPool {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<JobRegistry>,
        results: Arc<dyn ResultStore>,
        queue: JobQueue,
    ) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            config,
            registry,
            results,
            queue,
            stats: WorkerStats::new(),
            shutdown,
            shutdown_tx,
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn poll_once(&self) -> Result<Option<JobInvocation>> {
        self.poll_once_at(Utc::now()).await
    }

    /// Claim the next visible invocation at `now` and run it to completion.
    ///
    /// Returns the terminal invocation, or `None` when nothing was claimable.
    pub async fn poll_once_at(&self, now: DateTime<Utc>) -> Result<Option<JobInvocation>> {
        match self.claim_next_at(now).await? {
            Some(invocation) => self.execute(invocation, now).await.map(Some),
            None => Ok(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Claiming
    // ─────────────────────────────────────────────────────────────────────────

    /// Pop ids until one is claimed or the visible queue is drained.
    pub async fn claim_next_at(&self, now: DateTime<Utc>) -> Result<Option<JobInvocation>> {
        while let Some(id) = self.queue.dequeue_at(now).await? {
            match self
                .results
                .try_claim(id, &self.config.name, now, self.config.lease())
                .await?
            {
                ClaimOutcome::Claimed { invocation, reclaimed } => {
                    if reclaimed {
                        self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
                        metrics::record_reclaimed(1);
                    }
                    return Ok(Some(invocation));
                }
                ClaimOutcome::NotYetDue(at) => {
                    self.queue.enqueue(id, at).await?;
                }
                ClaimOutcome::Expired => {
                    self.stats.expired.fetch_add(1, Ordering::Relaxed);
                    metrics::record_expired(1);
                    tracing::warn!(invocation_id = %id, "Invocation expired before it was claimed");
                }
                ClaimOutcome::Unavailable(state) => {
                    tracing::debug!(invocation_id = %id, state = %state, "Skipping unclaimable invocation");
                }
                ClaimOutcome::NotFound => {
                    tracing::warn!(invocation_id = %id, "Queued id has no invocation record");
                }
            }
        }
        Ok(None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a claimed invocation, including retries, and write its outcome.
    ///
    /// `claimed_at` anchors the clock used for lease renewal and the
    /// finish timestamp. The outcome is only stored while the claim token
    /// carried by `invocation` is still the current one.
    pub async fn execute(&self, invocation: JobInvocation, claimed_at: DateTime<Utc>) -> Result<JobInvocation> {
        let span = tracing::info_span!(
            "execute_invocation",
            invocation_id = %invocation.id,
            job = %invocation.job_name,
            worker = %self.config.name
        );
        self.execute_inner(invocation, claimed_at).instrument(span).await
    }

    async fn execute_inner(&self, invocation: JobInvocation, claimed_at: DateTime<Utc>) -> Result<JobInvocation> {
        let token = invocation.claim_token.ok_or_else(|| {
            CadenceError::new(ErrorCode::InvalidStateTransition, "Invocation was not claimed by this pool")
        })?;
        let started = Instant::now();
        let clock = move || claimed_at + chrono::Duration::from_std(started.elapsed()).unwrap_or_default();

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        metrics::set_active_executions(self.stats.active());

        let outcome = match self.registry.resolve(&invocation.job_name) {
            Ok(job) => self.run_with_retries(job.as_ref(), &invocation, token, &clock).await,
            // Registry changed between submit and execution.
            Err(e) => InvocationOutcome::Failed(JobError::from(e).into()),
        };

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        metrics::set_active_executions(self.stats.active());

        let finished = self
            .results
            .complete(invocation.id, token, outcome, clock())
            .await;

        let finished = match finished {
            Ok(finished) => finished,
            Err(e) => {
                tracing::warn!(error = %e, "Claim lost before completion; outcome discarded");
                return Err(e);
            }
        };

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        match finished.state {
            InvocationState::Succeeded => self.stats.succeeded.fetch_add(1, Ordering::Relaxed),
            _ => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        metrics::record_terminal(finished.state, &finished.job_name, started.elapsed().as_secs_f64());

        tracing::info!(
            state = %finished.state,
            attempts = finished.attempts,
            duration_ms = started.elapsed().as_millis() as u64,
            "Invocation finished"
        );
        Ok(finished)
    }

    async fn run_with_retries(
        &self,
        job: &dyn Job,
        invocation: &JobInvocation,
        token: ClaimToken,
        clock: &(dyn Fn() -> DateTime<Utc> + Send + Sync),
    ) -> InvocationOutcome {
        let policy = job.retry_policy();
        let mut retries = 0;

        loop {
            let ctx = JobContext::new(
                invocation.id,
                invocation.job_name.clone(),
                self.config.name.clone(),
                invocation.scheduled_for,
                self.shutdown.clone(),
            )
            .with_attempt(retries + 1);

            let error = match self.run_attempt(job, &ctx, &invocation.job_args, token, clock).await {
                Ok(value) => return InvocationOutcome::Succeeded(value),
                Err(error) => error,
            };

            if !policy.should_retry(retries, &error) || ctx.is_shutting_down() {
                ctx.log_warn(&format!("attempt failed, giving up: {}", error));
                return InvocationOutcome::Failed(error.into());
            }

            let delay = policy.next_retry_delay(retries);
            ctx.log_warn(&format!("attempt failed, retrying in {}ms: {}", delay.as_millis(), error));
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            metrics::record_retry(&invocation.job_name);

            tokio::time::sleep(delay).await;
            retries += 1;

            if !self.renew(invocation.id, token, clock()).await {
                return InvocationOutcome::Failed(
                    JobError::infrastructure("claim lost while waiting to retry").into(),
                );
            }
        }
    }

    /// One attempt under the job's time budget, renewing the lease while it runs.
    async fn run_attempt(
        &self,
        job: &dyn Job,
        ctx: &JobContext,
        args: &[serde_json::Value],
        token: ClaimToken,
        clock: &(dyn Fn() -> DateTime<Utc> + Send + Sync),
    ) -> std::result::Result<serde_json::Value, JobError> {
        let limit = job.timeout();
        let attempt = tokio::time::timeout(limit, job.execute(ctx, args));
        tokio::pin!(attempt);

        let mut heartbeat = tokio::time::interval(self.config.renew_every());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(JobError::timeout(limit)),
                    };
                }
                _ = heartbeat.tick() => {
                    if !self.renew(ctx.invocation_id, token, clock()).await {
                        ctx.log_warn("lease renewal failed; another executor may take over");
                    }
                }
            }
        }
    }

    async fn renew(&self, id: InvocationId, token: ClaimToken, now: DateTime<Utc>) -> bool {
        match self
            .results
            .renew_claim(id, token, now, self.config.lease())
            .await
        {
            Ok(renewed) => renewed,
            Err(e) => {
                e.log();
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sweeping
    // ─────────────────────────────────────────────────────────────────────────

    /// Expire overdue Pending invocations and re-queue lapsed claims.
    ///
    /// Re-queueing an id that is still queued only moves it, so repeated
    /// sweeps over a long-lapsed claim keep a single queue entry.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let expired = self.results.expire_unclaimed(now).await?;
        if !expired.is_empty() {
            self.stats.expired.fetch_add(expired.len() as u64, Ordering::Relaxed);
            metrics::record_expired(expired.len() as u64);
            tracing::warn!(count = expired.len(), "Expired unclaimed invocations");
        }

        let stale = self.results.stale_claims(now).await?;
        for id in &stale {
            self.queue.enqueue(*id, now).await?;
        }
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "Re-queued invocations with lapsed leases");
        }

        metrics::set_queue_depth(self.queue.len().await?);
        Ok(SweepReport {
            expired,
            requeued: stale,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the claim loop and the sweeper, returning a handle for control.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let stats = self.stats.clone();
        let shutdown = self.shutdown_tx.clone();

        let claim_loop = tokio::spawn(Arc::clone(&self).run_claim_loop());
        let sweeper = tokio::spawn(Arc::clone(&self).run_sweeper());

        WorkerHandle {
            shutdown,
            stats,
            tasks: vec![claim_loop, sweeper],
        }
    }

    async fn run_claim_loop(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut shutdown_rx = self.shutdown.clone();

        tracing::info!(
            worker = %self.config.name,
            concurrency = self.config.concurrency,
            "Executor pool started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let now = Utc::now();
            match self.claim_next_at(now).await {
                Ok(Some(invocation)) => {
                    let pool = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        // Outcome and failures are recorded inside execute.
                        let _ = pool.execute(invocation, now).await;
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    e.log();
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(worker = %self.config.name, "Executor pool draining");
        let permits = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(self.config.shutdown_timeout, semaphore.acquire_many(permits)).await;
        match drained {
            Ok(_) => tracing::info!(worker = %self.config.name, "Executor pool stopped"),
            Err(_) => tracing::warn!(
                worker = %self.config.name,
                active = self.stats.active(),
                "Shutdown timed out; unfinished claims will be reclaimed after their lease"
            ),
        };
    }

    async fn run_sweeper(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.clone();
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_at(Utc::now()).await {
                        e.log();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.renew_every(), Duration::from_secs(100));
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.active(), 0);

        stats.processed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.processed(), 1);
    }
}
