//! PostgreSQL result store.
//!
//! Claims take the invocation row with `FOR UPDATE SKIP LOCKED`, so two
//! executors racing for the same id never both see it Pending.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{CadenceError, Result};
use crate::jobs::invocation::{lease_deadline, ClaimToken, InvocationId, InvocationOutcome, InvocationState, JobInvocation};
use crate::jobs::results::{decide_claim, ClaimOutcome, ResultStore};
use crate::jobs::schedule::ScheduleId;

const SELECT_COLUMNS: &str = r#"
    SELECT id, job_name, job_args, schedule_id, scheduled_for, claim_deadline, state, result,
           error, attempts, claimed_by, claim_token, lease_expires_at, created_at, started_at, finished_at
    FROM invocations
"#;

#[derive(Debug, sqlx::FromRow)]
struct InvocationRow {
    id: Uuid,
    job_name: String,
    job_args: serde_json::Value,
    schedule_id: Option<Uuid>,
    scheduled_for: DateTime<Utc>,
    claim_deadline: DateTime<Utc>,
    state: String,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    attempts: i32,
    claimed_by: Option<String>,
    claim_token: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<InvocationRow> for JobInvocation {
    type Error = CadenceError;

    fn try_from(row: InvocationRow) -> Result<Self> {
        Ok(Self {
            id: InvocationId(row.id),
            job_name: row.job_name,
            job_args: serde_json::from_value(row.job_args)?,
            schedule_id: row.schedule_id.map(ScheduleId),
            scheduled_for: row.scheduled_for,
            claim_deadline: row.claim_deadline,
            state: InvocationState::parse(&row.state)?,
            result: row.result,
            error: row.error.map(serde_json::from_value).transpose()?,
            attempts: row.attempts.max(0) as u32,
            claimed_by: row.claimed_by,
            claim_token: row.claim_token.map(ClaimToken),
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

/// Result store backed by the `invocations` table.
#[derive(Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        id: InvocationId,
        skip_locked: bool,
    ) -> Result<Option<JobInvocation>> {
        let clause = if skip_locked { "FOR UPDATE SKIP LOCKED" } else { "FOR UPDATE" };
        let row = sqlx::query_as::<_, InvocationRow>(&format!("{} WHERE id = $1 {}", SELECT_COLUMNS, clause))
            .bind(id.0)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(JobInvocation::try_from).transpose()
    }

    /// Write back every mutable column of a locked invocation.
    async fn save(tx: &mut Transaction<'_, Postgres>, invocation: &JobInvocation) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE invocations
            SET state = $2, result = $3, error = $4, attempts = $5, claimed_by = $6,
                claim_token = $7, lease_expires_at = $8, started_at = $9, finished_at = $10
            WHERE id = $1
            "#,
        )
        .bind(invocation.id.0)
        .bind(invocation.state.as_str())
        .bind(&invocation.result)
        .bind(invocation.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(invocation.attempts as i32)
        .bind(&invocation.claimed_by)
        .bind(invocation.claim_token.map(|t| t.0))
        .bind(invocation.lease_expires_at)
        .bind(invocation.started_at)
        .bind(invocation.finished_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn insert(&self, invocation: JobInvocation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO invocations (id, job_name, job_args, schedule_id, scheduled_for, claim_deadline,
                                     state, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(invocation.id.0)
        .bind(&invocation.job_name)
        .bind(serde_json::to_value(&invocation.job_args)?)
        .bind(invocation.schedule_id.map(|id| id.0))
        .bind(invocation.scheduled_for)
        .bind(invocation.claim_deadline)
        .bind(invocation.state.as_str())
        .bind(invocation.attempts as i32)
        .bind(invocation.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: InvocationId) -> Result<Option<JobInvocation>> {
        let row = sqlx::query_as::<_, InvocationRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobInvocation::try_from).transpose()
    }

    async fn try_claim(
        &self,
        id: InvocationId,
        worker: &str,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
    ) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(mut invocation) = Self::lock(&mut tx, id, true).await? else {
            tx.rollback().await?;
            // Either absent, or another executor holds the row lock right now.
            return Ok(match self.get(id).await? {
                Some(current) => ClaimOutcome::Unavailable(current.state),
                None => ClaimOutcome::NotFound,
            });
        };

        let outcome = decide_claim(&mut invocation, worker, now, visibility_timeout);
        if matches!(outcome, ClaimOutcome::Claimed { .. } | ClaimOutcome::Expired) {
            Self::save(&mut tx, &invocation).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn renew_claim(
        &self,
        id: InvocationId,
        token: ClaimToken,
        now: DateTime<Utc>,
        visibility_timeout: chrono::Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE invocations
            SET lease_expires_at = $3
            WHERE id = $1 AND state = 'running' AND claim_token = $2
            "#,
        )
        .bind(id.0)
        .bind(token.0)
        .bind(lease_deadline(now, visibility_timeout))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: InvocationId,
        token: ClaimToken,
        outcome: InvocationOutcome,
        now: DateTime<Utc>,
    ) -> Result<JobInvocation> {
        let mut tx = self.pool.begin().await?;
        let mut invocation = Self::lock(&mut tx, id, false)
            .await?
            .ok_or_else(|| CadenceError::invocation_not_found(id))?;

        let next = outcome.state();
        if !invocation.is_held_by(token) {
            return Err(CadenceError::invalid_state_transition(id, invocation.state, next));
        }

        invocation.finish(outcome, now);
        Self::save(&mut tx, &invocation).await?;
        tx.commit().await?;
        Ok(invocation)
    }

    async fn cancel(&self, id: InvocationId, now: DateTime<Utc>) -> Result<JobInvocation> {
        let mut tx = self.pool.begin().await?;
        let mut invocation = Self::lock(&mut tx, id, false)
            .await?
            .ok_or_else(|| CadenceError::invocation_not_found(id))?;

        if invocation.state != InvocationState::Pending {
            return Err(CadenceError::not_cancellable(id, invocation.state));
        }

        invocation.state = InvocationState::Cancelled;
        invocation.finished_at = Some(now);
        Self::save(&mut tx, &invocation).await?;
        tx.commit().await?;
        Ok(invocation)
    }

    async fn expire_unclaimed(&self, now: DateTime<Utc>) -> Result<Vec<InvocationId>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, InvocationRow>(&format!(
            "{} WHERE state = 'pending' AND claim_deadline <= $1 FOR UPDATE SKIP LOCKED",
            SELECT_COLUMNS
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut expired = Vec::with_capacity(rows.len());
        for row in rows {
            let mut invocation = JobInvocation::try_from(row)?;
            invocation.expire(now);
            Self::save(&mut tx, &invocation).await?;
            expired.push(invocation.id);
        }
        tx.commit().await?;
        Ok(expired)
    }

    async fn stale_claims(&self, now: DateTime<Utc>) -> Result<Vec<InvocationId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM invocations
            WHERE state = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(InvocationId).collect())
    }
}
