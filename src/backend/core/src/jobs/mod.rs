//! Periodic and delayed job scheduling.
//!
//! - **Schedules**: interval and crontab triggers stored in a [`ScheduleStore`]
//! - **Evaluator**: decides which schedules are due at a given instant
//! - **Dispatcher**: turns due schedules and ad-hoc submissions into queued invocations
//! - **Executor pool**: claims invocations and runs the registered [`Job`]
//! - **Result store**: invocation lifecycle from Pending to a terminal state
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        Beat (leader lease holder)                        │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐                │
//! │  │  Schedule    │───▶│   Due-Task   │───▶│  Dispatcher  │──┐             │
//! │  │   Store      │◀───│  Evaluator   │    │              │  │             │
//! │  └──────────────┘    └──────────────┘    └──────────────┘  │             │
//! │         ▲                record_fire            │          │             │
//! │         └───────────────────────────────────────┘          │             │
//! └────────────────────────────────────────────────────────────┼─────────────┘
//!                                                insert Pending│ enqueue id
//!                       ┌──────────────┐          ┌────────────▼─┐
//!                       │ Result Store │◀─────────│  Job Queue   │
//!                       │ (claims,     │  claim   │ (visibility  │
//!                       │  outcomes)   │◀──┐      │   delay)     │
//!                       └──────────────┘   │      └──────┬───────┘
//!                                          │             │ pop
//!                                     ┌────┴─────────────▼──┐
//!                                     │   Executor Pool     │
//!                                     │ (registry, retries) │
//!                                     └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use cadence_core::jobs::*;
//!
//! let schedules: Arc<dyn ScheduleStore> = Arc::new(InMemoryScheduleStore::new());
//! let results: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
//! let queue = JobQueue::in_memory();
//! let registry = Arc::new(JobRegistry::with_builtins());
//!
//! schedules
//!     .create(NewSchedule::interval("bump", 10, "increment").with_args(vec![json!(1)]), None)
//!     .await?;
//!
//! let dispatcher = Dispatcher::new(registry.clone(), schedules.clone(), results.clone(), queue.clone(), DispatcherConfig::default());
//! let beat = Arc::new(BeatScheduler::new(
//!     BeatConfig::default(),
//!     DueTaskEvaluator::new(schedules.clone()),
//!     dispatcher,
//!     Arc::new(InMemoryLeaderLease::new()),
//! ));
//! let pool = Arc::new(ExecutorPool::new(WorkerConfig::default(), registry, results, queue));
//!
//! let beat_handle = beat.start();
//! let pool_handle = pool.start();
//! ```

pub mod crontab;
pub mod dispatcher;
pub mod evaluator;
pub mod invocation;
pub mod job;
pub mod leader;
pub mod queue;
pub mod registry;
pub mod results;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use crontab::CronExpr;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use evaluator::{is_due, next_fire_time, DueTaskEvaluator};
pub use invocation::{ClaimToken, InvocationError, InvocationId, InvocationOutcome, InvocationState, JobInvocation};
pub use job::{BackoffStrategy, Job, JobContext, JobError, JobResult, RetryPolicy};
pub use leader::{InMemoryLeaderLease, LeaderLease, LeaseRecord, RedisLeaderLease};
pub use queue::{InMemoryQueueBackend, JobQueue, QueueBackend, QueuedInvocation, RedisQueueBackend};
pub use registry::JobRegistry;
pub use results::{ClaimOutcome, InMemoryResultStore, ResultStore};
pub use schedule::{
    CrontabFields, NewSchedule, ScheduleDefinition, ScheduleId, ScheduleKind, SchedulePatch, Trigger,
};
pub use scheduler::{BeatConfig, BeatHandle, BeatScheduler, TickReport};
pub use store::{InMemoryScheduleStore, ScheduleStore};
pub use worker::{ExecutorPool, SweepReport, WorkerConfig, WorkerHandle, WorkerStats};

// Built-in jobs
mod builtin;
pub use builtin::{IncrementJob, PredictTextJob};
