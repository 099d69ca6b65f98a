//! Job invocation records.
//!
//! A `JobInvocation` is one concrete, time-stamped execution request. It is
//! created `Pending` by the dispatcher, claimed into `Running` by exactly one
//! executor and terminated by that executor. State only moves forward:
//!
//! ```text
//! Pending ──► Running ──► Succeeded | Failed
//!    │
//!    ├──► Expired    (never claimed inside its window)
//!    └──► Cancelled  (cancelled before any claim)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::schedule::ScheduleId;
use crate::error::{CadenceError, ErrorCode, FailureClass, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Invocation Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(pub Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for InvocationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for InvocationId {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CadenceError::with_internal(ErrorCode::InvalidFormat, "Invalid invocation id", e.to_string()))
    }
}

/// Identity of one claim on an invocation.
///
/// Every successful `try_claim` mints a fresh token. Lease renewal and the
/// terminal write must present it, so an executor whose claim was taken
/// over cannot touch the invocation again even if it shares a worker name
/// with the new claimant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(pub Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invocation State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    /// Waiting for its `scheduled_for` instant and a claim
    Pending,
    /// Claimed by an executor
    Running,
    Succeeded,
    Failed,
    /// Not claimed within the visibility window
    Expired,
    /// Cancelled before an executor claimed it
    Cancelled,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: InvocationState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Expired)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CadenceError::with_internal(
                ErrorCode::DeserializationError,
                "Unknown invocation state",
                other.to_string(),
            )),
        }
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invocation Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured failure info stored on failed and expired invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationError {
    pub class: FailureClass,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl InvocationError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn expired(scheduled_for: DateTime<Utc>, deadline: DateTime<Utc>) -> Self {
        Self::new(
            FailureClass::Expired,
            format!(
                "not claimed between {} and {}",
                scheduled_for.to_rfc3339(),
                deadline.to_rfc3339()
            ),
        )
        .with_code(ErrorCode::InvocationExpired.to_string())
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Invocation
// ═══════════════════════════════════════════════════════════════════════════════

/// One execution request, owned by the result store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInvocation {
    pub id: InvocationId,
    pub job_name: String,
    pub job_args: Vec<serde_json::Value>,
    /// Schedule that produced this invocation; `None` for ad-hoc submissions
    pub schedule_id: Option<ScheduleId>,
    /// Not claimable before this instant
    pub scheduled_for: DateTime<Utc>,
    /// Expires if still pending at this instant
    pub claim_deadline: DateTime<Utc>,
    pub state: InvocationState,
    /// Present iff state is Succeeded
    pub result: Option<serde_json::Value>,
    /// Present iff state is Failed or Expired
    pub error: Option<InvocationError>,
    /// Number of claims taken, including reclaims after a lapsed lease
    pub attempts: u32,
    pub claimed_by: Option<String>,
    /// Token of the current claim; never exposed over the API
    #[serde(default, skip_serializing)]
    pub claim_token: Option<ClaimToken>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInvocation {
    /// Create a pending invocation.
    ///
    /// Fails with a validation error when `scheduled_for + claim_window`
    /// falls outside the representable time range.
    pub fn pending(
        id: InvocationId,
        job_name: impl Into<String>,
        job_args: Vec<serde_json::Value>,
        scheduled_for: DateTime<Utc>,
        claim_window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let claim_deadline = scheduled_for
            .checked_add_signed(claim_window)
            .ok_or_else(|| CadenceError::validation("scheduled time is out of range"))?;

        Ok(Self {
            id,
            job_name: job_name.into(),
            job_args,
            schedule_id: None,
            scheduled_for,
            claim_deadline,
            state: InvocationState::Pending,
            result: None,
            error: None,
            attempts: 0,
            claimed_by: None,
            claim_token: None,
            lease_expires_at: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn with_schedule(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    /// Claimable as a fresh pending invocation at `now`.
    pub fn is_claimable_pending(&self, now: DateTime<Utc>) -> bool {
        self.state == InvocationState::Pending
            && self.scheduled_for <= now
            && now < self.claim_deadline
    }

    /// Running, but the claim lapsed at `now`.
    pub fn is_stale_running(&self, now: DateTime<Utc>) -> bool {
        self.state == InvocationState::Running
            && self.lease_expires_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Pending past its deadline at `now`.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.state == InvocationState::Pending && now >= self.claim_deadline
    }

    /// Running under exactly this claim.
    pub fn is_held_by(&self, token: ClaimToken) -> bool {
        self.state == InvocationState::Running && self.claim_token == Some(token)
    }

    /// Take a claim under a fresh token. Caller must hold the store's row lock.
    pub fn claim(&mut self, worker: &str, now: DateTime<Utc>, visibility_timeout: chrono::Duration) -> ClaimToken {
        let token = ClaimToken::new();
        self.state = InvocationState::Running;
        self.attempts += 1;
        self.claimed_by = Some(worker.to_string());
        self.claim_token = Some(token);
        self.lease_expires_at = Some(lease_deadline(now, visibility_timeout));
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        token
    }

    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.error = Some(InvocationError::expired(self.scheduled_for, self.claim_deadline));
        self.state = InvocationState::Expired;
        self.finished_at = Some(now);
    }

    /// Apply a terminal outcome.
    pub fn finish(&mut self, outcome: InvocationOutcome, now: DateTime<Utc>) {
        match outcome {
            InvocationOutcome::Succeeded(value) => {
                self.state = InvocationState::Succeeded;
                self.result = Some(value);
                self.error = None;
            }
            InvocationOutcome::Failed(error) => {
                self.state = InvocationState::Failed;
                self.result = None;
                self.error = Some(error);
            }
        }
        self.lease_expires_at = None;
        self.claim_token = None;
        self.finished_at = Some(now);
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// End of a lease granted at `now`, saturating at the end of time.
pub fn lease_deadline(now: DateTime<Utc>, visibility_timeout: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(visibility_timeout)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Terminal outcome written by the executor holding the claim.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Succeeded(serde_json::Value),
    Failed(InvocationError),
}

impl InvocationOutcome {
    pub fn state(&self) -> InvocationState {
        match self {
            Self::Succeeded(_) => InvocationState::Succeeded,
            Self::Failed(_) => InvocationState::Failed,
        }
    }
}
