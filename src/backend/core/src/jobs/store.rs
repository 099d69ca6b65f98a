//! Schedule store.
//!
//! The store owns `ScheduleDefinition` records. Every mutation replaces a
//! whole record under a single lock (or a single-row transaction for the
//! Postgres store), so readers never observe a half-applied update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::schedule::{NewSchedule, ScheduleDefinition, ScheduleId, SchedulePatch};
use crate::error::{CadenceError, Result};

/// Durable table of schedule definitions.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Validate and insert a schedule. Names are unique.
    async fn create(&self, new: NewSchedule, created_by: Option<String>) -> Result<ScheduleDefinition>;

    /// Apply a patch; the result must still be a valid schedule.
    async fn update(&self, id: ScheduleId, patch: SchedulePatch) -> Result<ScheduleDefinition>;

    /// Stop evaluating a schedule. Disabling twice is not an error.
    async fn disable(&self, id: ScheduleId) -> Result<()>;

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduleDefinition>>;

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleDefinition>>;

    /// Snapshot of enabled schedules, ordered by name.
    async fn list_enabled(&self) -> Result<Vec<ScheduleDefinition>>;

    /// All schedules, ordered by name.
    async fn list_all(&self) -> Result<Vec<ScheduleDefinition>>;

    /// Record a successful dispatch: set `last_fired_at`, bump
    /// `total_run_count` and, for one-off schedules, disable.
    ///
    /// Only the dispatcher calls this, after its enqueue was acknowledged.
    async fn record_fire(&self, id: ScheduleId, fired_at: DateTime<Utc>, disable: bool) -> Result<()>;
}

/// In-memory schedule store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryScheduleStore {
    schedules: Arc<RwLock<HashMap<ScheduleId, ScheduleDefinition>>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut schedules: Vec<ScheduleDefinition>) -> Vec<ScheduleDefinition> {
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        schedules
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn create(&self, new: NewSchedule, created_by: Option<String>) -> Result<ScheduleDefinition> {
        let definition = new.into_definition(created_by, Utc::now())?;

        let mut schedules = self.schedules.write().await;
        if schedules.values().any(|s| s.name == definition.name) {
            return Err(CadenceError::duplicate_schedule(definition.name));
        }
        schedules.insert(definition.id, definition.clone());

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
        let mut schedules = self.schedules.write().await;
        let current = schedules
            .get(&id)
            .ok_or_else(|| CadenceError::schedule_not_found(id))?;

        let next = patch.apply(current, Utc::now())?;
        if next.name != current.name && schedules.values().any(|s| s.id != id && s.name == next.name) {
            return Err(CadenceError::duplicate_schedule(next.name));
        }
        schedules.insert(id, next.clone());

        tracing::info!(schedule_id = %id, "Schedule updated");
        Ok(next)
    }

    async fn disable(&self, id: ScheduleId) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .get_mut(&id)
            .ok_or_else(|| CadenceError::schedule_not_found(id))?;

        if schedule.enabled {
            schedule.enabled = false;
            schedule.updated_at = Utc::now();
            tracing::info!(schedule_id = %id, "Schedule disabled");
        }
        Ok(())
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduleDefinition>> {
        Ok(self.schedules.read().await.get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleDefinition>> {
        Ok(self
            .schedules
            .read()
            .await
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<ScheduleDefinition>> {
        let schedules = self.schedules.read().await;
        Ok(Self::sorted(schedules.values().filter(|s| s.enabled).cloned().collect()))
    }

    async fn list_all(&self) -> Result<Vec<ScheduleDefinition>> {
        let schedules = self.schedules.read().await;
        Ok(Self::sorted(schedules.values().cloned().collect()))
    }

    async fn record_fire(&self, id: ScheduleId, fired_at: DateTime<Utc>, disable: bool) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .get_mut(&id)
            .ok_or_else(|| CadenceError::schedule_not_found(id))?;

        schedule.last_fired_at = Some(fired_at);
        schedule.total_run_count += 1;
        if disable {
            schedule.enabled = false;
        }
        schedule.updated_at = Utc::now();
        Ok(())
    }
}
