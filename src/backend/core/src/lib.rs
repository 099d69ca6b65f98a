#![allow(clippy::result_large_err)]
//! # Cadence Core
//!
//! Durable periodic and delayed job scheduling.
//!
//! ## Architecture
//!
//! - **Schedule Store**: interval and crontab schedules, persisted in memory or PostgreSQL
//! - **Due-Task Evaluator**: decides which schedules are due at an instant
//! - **Dispatcher**: records invocations and enqueues them, then marks the schedule fired
//! - **Executor Pool**: claims invocations and runs registered jobs with retries and timeouts
//! - **Result Store**: invocation lifecycle and the claim authority
//! - **Leader Lease**: only one beat instance evaluates schedules at a time
//! - **Observability**: structured logging and Prometheus metrics

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod observability;

pub use error::{CadenceError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, FailureClass, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{CadenceError, ErrorCode, FailureClass, Result};
    pub use crate::jobs::{
        BeatScheduler, CrontabFields, Dispatcher, DueTaskEvaluator, ExecutorPool, InvocationId,
        InvocationState, Job, JobContext, JobError, JobInvocation, JobQueue, JobRegistry, JobResult,
        LeaderLease, NewSchedule, ResultStore, RetryPolicy, ScheduleDefinition, ScheduleId,
        ScheduleStore,
    };
}
