//! Result store.
//!
//! The result store owns `JobInvocation` records and is the single authority
//! on claims: an executor may only run an invocation after `try_claim`
//! handed it over, and may only write an outcome while its claim stands.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::invocation::{lease_deadline, ClaimToken, InvocationId, InvocationOutcome, InvocationState, JobInvocation};
use crate::error::{CadenceError, Result};

/// Result of a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller now holds the claim
    Claimed {
        invocation: JobInvocation,
        /// Taken over from an executor whose lease lapsed
        reclaimed: bool,
    },
    /// Not claimable before this instant
    NotYetDue(DateTime<Utc>),
    /// The claim window had passed; the invocation is now Expired
    Expired,
    /// Claimed by someone else, cancelled or already finished
    Unavailable(InvocationState),
    NotFound,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed { .. })
    }
}

/// Durable record of invocations and their outcomes.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a new Pending invocation.
    async fn insert(&self, invocation: JobInvocation) -> Result<()>;

    async fn get(&self, id: InvocationId) -> Result<Option<JobInvocation>>;

    /// Atomically claim an invocation for `worker`.
    ///
    /// Succeeds for a due Pending invocation, or for a Running one whose
    /// lease has lapsed. Expires a Pending invocation found past its claim
    /// deadline.
    async fn try_claim(
        &self,
        id: InvocationId,
        worker: &str,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
    ) -> Result<ClaimOutcome>;

    /// Extend the lease of the claim identified by `token`. Returns false if
    /// the claim was lost.
    async fn renew_claim(
        &self,
        id: InvocationId,
        token: ClaimToken,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
    ) -> Result<bool>;

    /// Write the terminal outcome. Fails unless `token` is the current claim.
    async fn complete(
        &self,
        id: InvocationId,
        token: ClaimToken,
        outcome: InvocationOutcome,
        now: DateTime<Utc>,
    ) -> Result<JobInvocation>;

    /// Cancel a Pending invocation.
    async fn cancel(&self, id: InvocationId, now: DateTime<Utc>) -> Result<JobInvocation>;

    /// Move every Pending invocation past its claim deadline to Expired.
    async fn expire_unclaimed(&self, now: DateTime<Utc>) -> Result<Vec<InvocationId>>;

    /// Running invocations whose lease lapsed at `now`.
    async fn stale_claims(&self, now: DateTime<Utc>) -> Result<Vec<InvocationId>>;
}

/// Apply a claim attempt to a locked invocation record.
///
/// The caller must hold the record exclusively and persist it afterwards.
pub(crate) fn decide_claim(
    invocation: &mut JobInvocation,
    worker: &str,
    now: DateTime<Utc>,
    visibility_timeout: chrono::Duration,
) -> ClaimOutcome {
    match invocation.state {
        InvocationState::Pending if invocation.is_past_deadline(now) => {
            invocation.expire(now);
            ClaimOutcome::Expired
        }
        InvocationState::Pending if invocation.scheduled_for > now => {
            ClaimOutcome::NotYetDue(invocation.scheduled_for)
        }
        InvocationState::Pending => {
            invocation.claim(worker, now, visibility_timeout);
            ClaimOutcome::Claimed {
                invocation: invocation.clone(),
                reclaimed: false,
            }
        }
        InvocationState::Running if invocation.is_stale_running(now) => {
            tracing::warn!(
                invocation_id = %invocation.id,
                previous = ?invocation.claimed_by,
                worker,
                "Reclaiming invocation with lapsed lease"
            );
            invocation.claim(worker, now, visibility_timeout);
            ClaimOutcome::Claimed {
                invocation: invocation.clone(),
                reclaimed: true,
            }
        }
        state => ClaimOutcome::Unavailable(state),
    }
}

/// In-memory result store. Every operation runs under one mutex.
#[derive(Clone, Default)]
pub struct InMemoryResultStore {
    invocations: Arc<Mutex<HashMap<InvocationId, JobInvocation>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.invocations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.lock().is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn insert(&self, invocation: JobInvocation) -> Result<()> {
        let mut invocations = self.invocations.lock();
        if invocations.contains_key(&invocation.id) {
            return Err(CadenceError::new(
                crate::error::ErrorCode::DuplicateRecord,
                "Invocation already exists",
            ));
        }
        invocations.insert(invocation.id, invocation);
        Ok(())
    }

    async fn get(&self, id: InvocationId) -> Result<Option<JobInvocation>> {
        Ok(self.invocations.lock().get(&id).cloned())
    }

    async fn try_claim(
        &self,
        id: InvocationId,
        worker: &str,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
    ) -> Result<ClaimOutcome> {
        let mut invocations = self.invocations.lock();
        let Some(invocation) = invocations.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        Ok(decide_claim(invocation, worker, now, visibility_timeout))
    }

    async fn renew_claim(
        &self,
        id: InvocationId,
        token: ClaimToken,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
    ) -> Result<bool> {
        let mut invocations = self.invocations.lock();
        let Some(invocation) = invocations.get_mut(&id) else {
            return Ok(false);
        };
        if !invocation.is_held_by(token) {
            return Ok(false);
        }
        invocation.lease_expires_at = Some(lease_deadline(now, visibility_timeout));
        Ok(true)
    }

    async fn complete(
        &self,
        id: InvocationId,
        token: ClaimToken,
        outcome: InvocationOutcome,
        now: DateTime<Utc>,
    ) -> Result<JobInvocation> {
        let mut invocations = self.invocations.lock();
        let invocation = invocations
            .get_mut(&id)
            .ok_or_else(|| CadenceError::invocation_not_found(id))?;

        let next = outcome.state();
        if !invocation.is_held_by(token) {
            return Err(CadenceError::invalid_state_transition(id, invocation.state, next));
        }

        invocation.finish(outcome, now);
        Ok(invocation.clone())
    }

    async fn cancel(&self, id: InvocationId, now: DateTime<Utc>) -> Result<JobInvocation> {
        let mut invocations = self.invocations.lock();
        let invocation = invocations
            .get_mut(&id)
            .ok_or_else(|| CadenceError::invocation_not_found(id))?;

        if invocation.state != InvocationState::Pending {
            return Err(CadenceError::not_cancellable(id, invocation.state));
        }

        invocation.state = InvocationState::Cancelled;
        invocation.finished_at = Some(now);
        Ok(invocation.clone())
    }

    async fn expire_unclaimed(&self, now: DateTime<Utc>) -> Result<Vec<InvocationId>> {
        let mut invocations = self.invocations.lock();
        let mut expired = Vec::new();
        for invocation in invocations.values_mut() {
            if invocation.is_past_deadline(now) {
                invocation.expire(now);
                expired.push(invocation.id);
            }
        }
        Ok(expired)
    }

    async fn stale_claims(&self, now: DateTime<Utc>) -> Result<Vec<InvocationId>> {
        Ok(self
            .invocations
            .lock()
            .values()
            .filter(|i| i.is_stale_running(now))
            .map(|i| i.id)
            .collect())
    }
}
