//! Job definitions and traits.
//!
//! This module provides the core abstractions for registered job handlers:
//!
//! - **Job trait**: The interface every named handler implements
//! - **JobContext**: Context passed to a handler during one attempt
//! - **JobError**: Classified failure returned by a handler
//! - **RetryPolicy**: Declared retry behavior with backoff strategies

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::invocation::{InvocationError, InvocationId};
use crate::error::{CadenceError, FailureClass};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Application, infrastructure or timeout
    pub class: FailureClass,
    /// Whether a retrying policy may run the job again
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// A transient application failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: FailureClass::Application,
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// A permanent application failure, e.g. bad input.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: FailureClass::Application,
            retryable: false,
            code: None,
            context: None,
        }
    }

    /// A store, queue or network dependency was unavailable.
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: FailureClass::Infrastructure,
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// The attempt ran past the job's declared budget.
    pub fn timeout(limit: Duration) -> Self {
        Self {
            message: format!("job exceeded its {}ms time budget", limit.as_millis()),
            class: FailureClass::Timeout,
            retryable: false,
            code: Some("JOB_TIMEOUT".to_string()),
            context: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.class == FailureClass::Timeout
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<CadenceError> for JobError {
    fn from(error: CadenceError) -> Self {
        Self {
            message: error.user_message().to_string(),
            class: error.failure_class(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

impl From<JobError> for InvocationError {
    fn from(error: JobError) -> Self {
        let mut stored = InvocationError::new(error.class, error.message);
        stored.code = error.code;
        stored
    }
}

/// Result type for job execution.
pub type JobResult<T = serde_json::Value> = std::result::Result<T, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        delay_ms: u64,
    },
    /// Linear increase in delay (initial + increment * attempt)
    Linear {
        initial_delay_ms: u64,
        increment_ms: u64,
    },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Linear {
                initial_delay_ms,
                increment_ms,
            } => initial_delay_ms + (increment_ms * attempt as u64),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_ms as f64) as u64
            }
        };

        Duration::from_millis(ms)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential() -> Self {
        Self::default()
    }

    /// Exponential from `base`, capped at `max`.
    pub fn exponential_from(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Declared retry behavior of a job.
///
/// Jobs are not retried unless they opt in: the default policy has
/// `max_attempts = 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first (0 = no retries)
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
    /// Retry any error, not only those flagged retryable
    pub retry_on_any_error: bool,
    /// Retry after a timeout
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            backoff: BackoffStrategy::default(),
            retry_on_any_error: false,
            retry_on_timeout: false,
        }
    }

    /// Idempotent-retryable with exponential backoff.
    pub fn exponential_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::exponential(),
            ..Self::no_retry()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retrying_timeouts(mut self) -> Self {
        self.retry_on_timeout = true;
        self
    }

    /// Check if another attempt should run after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32, error: &JobError) -> bool {
        if retries_done >= self.max_attempts {
            return false;
        }

        if error.is_timeout() {
            return self.retry_on_timeout;
        }

        self.retry_on_any_error || error.retryable
    }

    /// Get the delay before the next retry.
    pub fn next_retry_delay(&self, retries_done: u32) -> Duration {
        self.backoff.delay_for_attempt(retries_done)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to jobs during one execution attempt.
pub struct JobContext {
    pub invocation_id: InvocationId,
    pub job_name: String,
    /// Executor that holds the claim
    pub worker: String,
    /// 1-indexed attempt within the current claim
    pub attempt: u32,
    pub scheduled_for: DateTime<Utc>,
    cancellation: tokio::sync::watch::Receiver<bool>,
}

impl JobContext {
    pub fn new(
        invocation_id: InvocationId,
        job_name: impl Into<String>,
        worker: impl Into<String>,
        scheduled_for: DateTime<Utc>,
        cancellation: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        Self {
            invocation_id,
            job_name: job_name.into(),
            worker: worker.into(),
            attempt: 1,
            scheduled_for,
            cancellation,
        }
    }

    /// Context for calling a handler outside an executor.
    pub fn detached(invocation_id: InvocationId, job_name: impl Into<String>) -> Self {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        Self::new(invocation_id, job_name, "detached", Utc::now(), rx)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Whether the executor is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        *self.cancellation.borrow()
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(
            invocation_id = %self.invocation_id,
            job = %self.job_name,
            attempt = self.attempt,
            message
        );
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            invocation_id = %self.invocation_id,
            job = %self.job_name,
            attempt = self.attempt,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A named, registered job handler.
///
/// The scheduler knows a handler only by its name, its retry policy and its
/// time budget. Arguments and results are opaque JSON values.
#[async_trait]
pub trait Job: Send + Sync {
    /// Name the registry resolves this handler by.
    fn name(&self) -> &'static str;

    /// Run one attempt.
    ///
    /// # Errors
    ///
    /// Return `JobError::retryable()` for transient failures that a retrying
    /// policy may repeat, and `JobError::fatal()` for permanent ones.
    async fn execute(&self, ctx: &JobContext, args: &[serde_json::Value]) -> JobResult;

    /// Override to declare the job idempotent-retryable.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::no_retry()
    }

    /// Maximum run duration of a single attempt.
    fn timeout(&self) -> Duration {
        Duration::from_secs(300)
    }
}
