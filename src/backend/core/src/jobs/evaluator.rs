//! Due-task evaluation.
//!
//! Given an instant, decide which enabled schedules fire. The rules only
//! depend on the schedule record and `now`, so evaluating the same snapshot
//! twice yields the same due set, and a resumed evaluator fires each due
//! schedule at most once no matter how many ticks it missed.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::crontab::floor_to_minute;
use super::schedule::{ScheduleDefinition, Trigger};
use super::store::ScheduleStore;
use crate::error::Result;

pub struct DueTaskEvaluator {
    store: Arc<dyn ScheduleStore>,
}

impl DueTaskEvaluator {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }

    /// Read the enabled schedules and return those due at `now`.
    pub async fn poll(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleDefinition>> {
        let schedules = self.store.list_enabled().await?;
        Ok(Self::evaluate(&schedules, now))
    }

    /// Due subset of `schedules` at `now`, in input order.
    ///
    /// Schedules whose stored trigger no longer parses are skipped with a
    /// warning rather than failing the whole tick.
    pub fn evaluate(schedules: &[ScheduleDefinition], now: DateTime<Utc>) -> Vec<ScheduleDefinition> {
        schedules
            .iter()
            .filter(|schedule| match is_due(schedule, now) {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        name = %schedule.name,
                        error = %e,
                        "Skipping schedule with invalid trigger"
                    );
                    false
                }
            })
            .cloned()
            .collect()
    }
}

/// Whether `schedule` should fire at `now`.
pub fn is_due(schedule: &ScheduleDefinition, now: DateTime<Utc>) -> Result<bool> {
    if !schedule.enabled || !schedule.is_active_at(now) {
        return Ok(false);
    }

    Ok(match schedule.trigger()? {
        Trigger::Interval(interval) => match schedule.last_fired_at {
            None => true,
            Some(last) => now - last >= interval,
        },
        Trigger::Crontab(expr) => {
            let minute = floor_to_minute(now);
            let advanced = schedule
                .last_fired_at
                .map(|last| floor_to_minute(last) < minute)
                .unwrap_or(true);
            advanced && expr.matches(minute)
        }
    })
}

/// Earliest instant at or after `now` at which `schedule` would be due,
/// assuming no other dispatch happens first. `None` if it never fires again.
pub fn next_fire_time(schedule: &ScheduleDefinition, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if !schedule.enabled {
        return Ok(None);
    }
    if is_due(schedule, now)? {
        return Ok(Some(now));
    }

    let earliest = schedule.start_at.filter(|start| *start > now).unwrap_or(now);
    let candidate = match schedule.trigger()? {
        Trigger::Interval(interval) => {
            // Past the end of representable time means it never fires again.
            match schedule.last_fired_at {
                Some(last) => last.checked_add_signed(interval).map(|at| at.max(earliest)),
                None => Some(earliest),
            }
        }
        Trigger::Crontab(expr) => {
            let mut search_from = earliest.checked_sub_signed(Duration::minutes(1)).unwrap_or(earliest);
            if let Some(last) = schedule.last_fired_at {
                search_from = search_from.max(floor_to_minute(last));
            }
            expr.next_after(search_from).map(|at| at.max(earliest))
        }
    };

    Ok(candidate.filter(|at| schedule.expires_at.map(|end| *at < end).unwrap_or(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::schedule::{CrontabFields, NewSchedule, MAX_INTERVAL_SECS};
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, h, m, s).unwrap()
    }

    fn interval(secs: u64) -> ScheduleDefinition {
        NewSchedule::interval("interval", secs, "increment")
            .into_definition(None, t(0, 0, 0))
            .unwrap()
    }

    fn crontab(fields: CrontabFields) -> ScheduleDefinition {
        NewSchedule::crontab("cron", fields, "increment")
            .into_definition(None, t(0, 0, 0))
            .unwrap()
    }

    #[test]
    fn test_interval_never_fired_is_due() {
        assert!(is_due(&interval(60), t(0, 0, 0)).unwrap());
    }

    #[test]
    fn test_interval_due_after_elapsed() {
        let mut s = interval(60);
        s.last_fired_at = Some(t(0, 0, 0));
        assert!(!is_due(&s, t(0, 0, 59)).unwrap());
        assert!(is_due(&s, t(0, 1, 0)).unwrap());
    }

    #[test]
    fn test_next_fire_beyond_time_range_is_never() {
        let mut s = interval(MAX_INTERVAL_SECS);
        let last = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        s.last_fired_at = Some(last);

        assert!(!is_due(&s, last).unwrap());
        assert_eq!(next_fire_time(&s, last).unwrap(), None);
    }

    #[test]
    fn test_sub_minute_interval() {
        let mut s = interval(5);
        s.last_fired_at = Some(t(0, 0, 0));
        assert!(is_due(&s, t(0, 0, 5)).unwrap());
    }

    #[test]
    fn test_crontab_fires_once_per_minute() {
        let mut s = crontab(CrontabFields::default().minute("*/1"));
        assert!(is_due(&s, t(0, 0, 0)).unwrap());

        s.last_fired_at = Some(t(0, 0, 0));
        assert!(!is_due(&s, t(0, 0, 30)).unwrap());
        assert!(is_due(&s, t(0, 1, 0)).unwrap());
    }

    #[test]
    fn test_crontab_no_catch_up_after_downtime() {
        let mut s = crontab(CrontabFields::default().minute("0"));
        s.last_fired_at = Some(t(1, 0, 0));
        // Down for hours 2-4; resumes mid-hour, nothing due.
        assert!(!is_due(&s, t(5, 30, 0)).unwrap());
        assert!(is_due(&s, t(6, 0, 10)).unwrap());
    }

    #[test]
    fn test_disabled_and_window() {
        let mut s = interval(60);
        s.enabled = false;
        assert!(!is_due(&s, t(0, 0, 0)).unwrap());

        let mut s = interval(60);
        s.start_at = Some(t(1, 0, 0));
        assert!(!is_due(&s, t(0, 30, 0)).unwrap());
        assert!(is_due(&s, t(1, 0, 0)).unwrap());

        s.expires_at = Some(t(2, 0, 0));
        assert!(!is_due(&s, t(2, 0, 0)).unwrap());
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let schedules = vec![interval(60), crontab(CrontabFields::default().minute("30"))];
        let first = DueTaskEvaluator::evaluate(&schedules, t(0, 0, 0));
        let second = DueTaskEvaluator::evaluate(&schedules, t(0, 0, 0));
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn test_next_fire_time() {
        let mut s = interval(60);
        assert_eq!(next_fire_time(&s, t(0, 0, 0)).unwrap(), Some(t(0, 0, 0)));
        s.last_fired_at = Some(t(0, 0, 0));
        assert_eq!(next_fire_time(&s, t(0, 0, 10)).unwrap(), Some(t(0, 1, 0)));

        let mut c = crontab(CrontabFields::default().minute("15"));
        assert_eq!(next_fire_time(&c, t(0, 0, 0)).unwrap(), Some(t(0, 15, 0)));
        c.last_fired_at = Some(t(0, 15, 0));
        assert_eq!(next_fire_time(&c, t(0, 15, 30)).unwrap(), Some(t(1, 15, 0)));

        c.expires_at = Some(t(1, 0, 0));
        assert_eq!(next_fire_time(&c, t(0, 15, 30)).unwrap(), None);

        c.enabled = false;
        assert_eq!(next_fire_time(&c, t(0, 0, 0)).unwrap(), None);
    }
}
