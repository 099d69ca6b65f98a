//! PostgreSQL schedule store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CadenceError, ErrorCode, Result};
use crate::jobs::schedule::{
    CrontabFields, NewSchedule, ScheduleDefinition, ScheduleId, ScheduleKind, SchedulePatch,
};
use crate::jobs::store::ScheduleStore;

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, description, kind, interval_seconds, crontab, job_name, job_args,
           enabled, one_off, last_fired_at, total_run_count, start_at, expires_at,
           created_by, created_at, updated_at
    FROM schedules
"#;

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    kind: String,
    interval_seconds: Option<i64>,
    crontab: Option<String>,
    job_name: String,
    job_args: serde_json::Value,
    enabled: bool,
    one_off: bool,
    last_fired_at: Option<DateTime<Utc>>,
    total_run_count: i64,
    start_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for ScheduleDefinition {
    type Error = CadenceError;

    fn try_from(row: ScheduleRow) -> Result<Self> {
        Ok(Self {
            id: ScheduleId(row.id),
            name: row.name,
            description: row.description,
            kind: ScheduleKind::parse(&row.kind)?,
            interval_seconds: row.interval_seconds.map(|s| s.max(0) as u64),
            crontab: row.crontab.as_deref().map(str::parse::<CrontabFields>).transpose()?,
            job_name: row.job_name,
            job_args: serde_json::from_value(row.job_args)?,
            enabled: row.enabled,
            one_off: row.one_off,
            last_fired_at: row.last_fired_at,
            total_run_count: row.total_run_count.max(0) as u64,
            start_at: row.start_at,
            expires_at: row.expires_at,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_definitions(rows: Vec<ScheduleRow>) -> Result<Vec<ScheduleDefinition>> {
    rows.into_iter().map(ScheduleDefinition::try_from).collect()
}

/// Schedule store backed by the `schedules` table.
#[derive(Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn create(&self, new: NewSchedule, created_by: Option<String>) -> Result<ScheduleDefinition> {
        let definition = new.into_definition(created_by, Utc::now())?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO schedules (id, name, description, kind, interval_seconds, crontab, job_name,
                                   job_args, enabled, one_off, start_at, expires_at, created_by,
                                   created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(definition.id.0)
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.kind.as_str())
        .bind(definition.interval_seconds.map(|s| s as i64))
        .bind(definition.crontab.as_ref().map(|c| c.to_string()))
        .bind(&definition.job_name)
        .bind(serde_json::to_value(&definition.job_args)?)
        .bind(definition.enabled)
        .bind(definition.one_off)
        .bind(definition.start_at)
        .bind(definition.expires_at)
        .bind(&definition.created_by)
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = inserted {
            let err = CadenceError::from(e);
            if err.code() == ErrorCode::DuplicateRecord {
                return Err(CadenceError::duplicate_schedule(definition.name));
            }
            return Err(err);
        }

        tracing::info!(
            schedule_id = %definition.id,
            name = %definition.name,
            kind = %definition.kind,
            job = %definition.job_name,
            "Schedule created"
        );
        Ok(definition)
    }

    async fn update(&self, id: ScheduleId, patch: SchedulePatch) -> Result<ScheduleDefinition> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ScheduleRow>(&format!("{} WHERE id = $1 FOR UPDATE", SELECT_COLUMNS))
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CadenceError::schedule_not_found(id))?;
        let current = ScheduleDefinition::try_from(row)?;
        let next = patch.apply(&current, Utc::now())?;

        let updated = sqlx::query(
            r#"
            UPDATE schedules
            SET name = $2, description = $3, kind = $4, interval_seconds = $5, crontab = $6,
                job_name = $7, job_args = $8, enabled = $9, one_off = $10, start_at = $11,
                expires_at = $12, updated_at = $13
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(&next.name)
        .bind(&next.description)
        .bind(next.kind.as_str())
        .bind(next.interval_seconds.map(|s| s as i64))
        .bind(next.crontab.as_ref().map(|c| c.to_string()))
        .bind(&next.job_name)
        .bind(serde_json::to_value(&next.job_args)?)
        .bind(next.enabled)
        .bind(next.one_off)
        .bind(next.start_at)
        .bind(next.expires_at)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = updated {
            let err = CadenceError::from(e);
            if err.code() == ErrorCode::DuplicateRecord {
                return Err(CadenceError::duplicate_schedule(next.name));
            }
            return Err(err);
        }
        tx.commit().await?;

        tracing::info!(schedule_id = %id, "Schedule updated");
        Ok(next)
    }

    async fn disable(&self, id: ScheduleId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET enabled = FALSE,
                updated_at = CASE WHEN enabled THEN $2 ELSE updated_at END
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CadenceError::schedule_not_found(id));
        }
        tracing::info!(schedule_id = %id, "Schedule disabled");
        Ok(())
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduleDefinition>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScheduleDefinition::try_from).transpose()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleDefinition>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!("{} WHERE name = $1", SELECT_COLUMNS))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScheduleDefinition::try_from).transpose()
    }

    async fn list_enabled(&self) -> Result<Vec<ScheduleDefinition>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!("{} WHERE enabled ORDER BY name", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        into_definitions(rows)
    }

    async fn list_all(&self) -> Result<Vec<ScheduleDefinition>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!("{} ORDER BY name", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        into_definitions(rows)
    }

    async fn record_fire(&self, id: ScheduleId, fired_at: DateTime<Utc>, disable: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET last_fired_at = $2,
                total_run_count = total_run_count + 1,
                enabled = enabled AND NOT $3,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(fired_at)
        .bind(disable)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CadenceError::schedule_not_found(id));
        }
        Ok(())
    }
}
