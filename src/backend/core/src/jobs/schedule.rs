//! Schedule definitions.
//!
//! A schedule is a durable rule that says when a named job should run:
//! either every `interval_seconds`, or on every minute matching five
//! crontab fields (evaluated in UTC).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::crontab::CronExpr;
use crate::error::{CadenceError, ErrorCode, Result};

const MAX_NAME_LEN: usize = 200;

/// Longest accepted interval: one hundred years.
pub const MAX_INTERVAL_SECS: u64 = 100 * 366 * 24 * 3600;

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Identification
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ScheduleId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for ScheduleId {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CadenceError::with_internal(ErrorCode::InvalidFormat, "Invalid schedule id", e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Kind
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Interval,
    Crontab,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Crontab => "crontab",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "interval" => Ok(Self::Interval),
            "crontab" => Ok(Self::Crontab),
            other => Err(CadenceError::invalid_schedule(format!("unknown schedule kind '{}'", other))),
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Crontab Fields
// ═══════════════════════════════════════════════════════════════════════════════

/// The five crontab patterns, as written. Omitted fields default to `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrontabFields {
    #[serde(default = "wildcard")]
    pub minute: String,
    #[serde(default = "wildcard")]
    pub hour: String,
    #[serde(default = "wildcard")]
    pub day_of_month: String,
    #[serde(default = "wildcard")]
    pub month: String,
    #[serde(default = "wildcard")]
    pub day_of_week: String,
}

fn wildcard() -> String {
    "*".to_string()
}

impl Default for CrontabFields {
    fn default() -> Self {
        Self {
            minute: wildcard(),
            hour: wildcard(),
            day_of_month: wildcard(),
            month: wildcard(),
            day_of_week: wildcard(),
        }
    }
}

impl CrontabFields {
    pub fn minute(mut self, pattern: impl Into<String>) -> Self {
        self.minute = pattern.into();
        self
    }

    pub fn hour(mut self, pattern: impl Into<String>) -> Self {
        self.hour = pattern.into();
        self
    }

    pub fn day_of_month(mut self, pattern: impl Into<String>) -> Self {
        self.day_of_month = pattern.into();
        self
    }

    pub fn month(mut self, pattern: impl Into<String>) -> Self {
        self.month = pattern.into();
        self
    }

    pub fn day_of_week(mut self, pattern: impl Into<String>) -> Self {
        self.day_of_week = pattern.into();
        self
    }
}

/// Parses a classic five-field line, e.g. `"*/15 9-17 * * 1-5"`.
impl FromStr for CrontabFields {
    type Err = CadenceError;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CadenceError::invalid_crontab(
                "expression",
                line,
                format!("expected 5 fields, found {}", parts.len()),
            ));
        }
        Ok(Self {
            minute: parts[0].to_string(),
            hour: parts[1].to_string(),
            day_of_month: parts[2].to_string(),
            month: parts[3].to_string(),
            day_of_week: parts[4].to_string(),
        })
    }
}

impl fmt::Display for CrontabFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Definition
// ═══════════════════════════════════════════════════════════════════════════════

/// A stored schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: ScheduleId,
    /// Unique, human-chosen key
    pub name: String,
    pub description: Option<String>,
    pub kind: ScheduleKind,
    /// Present iff kind is Interval
    pub interval_seconds: Option<u64>,
    /// Present iff kind is Crontab
    pub crontab: Option<CrontabFields>,
    pub job_name: String,
    pub job_args: Vec<serde_json::Value>,
    pub enabled: bool,
    /// Disable after the first successful dispatch
    pub one_off: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub total_run_count: u64,
    /// Never due before this instant
    pub start_at: Option<DateTime<Utc>>,
    /// Never due at or after this instant
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parsed firing rule of a schedule.
#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(chrono::Duration),
    Crontab(CronExpr),
}

impl ScheduleDefinition {
    /// Check the shape invariants. Crontab fields are fully parsed.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(CadenceError::invalid_schedule("name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(CadenceError::invalid_schedule(format!(
                "name must be at most {} characters",
                MAX_NAME_LEN
            )));
        }
        if self.job_name.trim().is_empty() {
            return Err(CadenceError::invalid_schedule("job_name must not be empty"));
        }
        if let (Some(start), Some(end)) = (self.start_at, self.expires_at) {
            if start >= end {
                return Err(CadenceError::invalid_schedule("start_at must be before expires_at"));
            }
        }
        self.trigger().map(|_| ())
    }

    /// Parse the firing rule, enforcing that exactly one of
    /// `interval_seconds` and `crontab` is set and that it matches `kind`.
    pub fn trigger(&self) -> Result<Trigger> {
        match (self.kind, self.interval_seconds, &self.crontab) {
            (_, Some(_), Some(_)) => Err(CadenceError::invalid_schedule(
                "interval_seconds and crontab are mutually exclusive",
            )),
            (_, None, None) => Err(CadenceError::invalid_schedule(
                "one of interval_seconds or crontab is required",
            )),
            (ScheduleKind::Interval, Some(0), None) => Err(CadenceError::invalid_schedule(
                "interval_seconds must be positive",
            )),
            (ScheduleKind::Interval, Some(secs), None) => i64::try_from(secs)
                .ok()
                .filter(|_| secs <= MAX_INTERVAL_SECS)
                .and_then(chrono::Duration::try_seconds)
                .map(Trigger::Interval)
                .ok_or_else(|| {
                    CadenceError::invalid_schedule(format!(
                        "interval_seconds must be at most {}",
                        MAX_INTERVAL_SECS
                    ))
                }),
            (ScheduleKind::Crontab, None, Some(fields)) => Ok(Trigger::Crontab(CronExpr::parse(fields)?)),
            (kind, _, _) => Err(CadenceError::invalid_schedule(format!(
                "kind '{}' does not match the fields provided",
                kind
            ))),
        }
    }

    /// Whether the activity window admits `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start_at.map(|start| now >= start).unwrap_or(true)
            && self.expires_at.map(|end| now < end).unwrap_or(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Create / Update Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// Input of `ScheduleStore::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Inferred from the fields present when omitted
    #[serde(default)]
    pub kind: Option<ScheduleKind>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub crontab: Option<CrontabFields>,
    pub job_name: String,
    #[serde(default)]
    pub job_args: Vec<serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub one_off: bool,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Only `UTC` is accepted
    #[serde(default)]
    pub timezone: Option<String>,
}

fn default_true() -> bool {
    true
}

impl NewSchedule {
    pub fn interval(name: impl Into<String>, interval_seconds: u64, job_name: impl Into<String>) -> Self {
        Self {
            kind: Some(ScheduleKind::Interval),
            interval_seconds: Some(interval_seconds),
            ..Self::blank(name.into(), job_name.into())
        }
    }

    pub fn crontab(name: impl Into<String>, fields: CrontabFields, job_name: impl Into<String>) -> Self {
        Self {
            kind: Some(ScheduleKind::Crontab),
            crontab: Some(fields),
            ..Self::blank(name.into(), job_name.into())
        }
    }

    fn blank(name: String, job_name: String) -> Self {
        Self {
            name,
            description: None,
            kind: None,
            interval_seconds: None,
            crontab: None,
            job_name,
            job_args: Vec::new(),
            enabled: true,
            one_off: false,
            start_at: None,
            expires_at: None,
            timezone: None,
        }
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.job_args = args;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn one_off(mut self) -> Self {
        self.one_off = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn active_between(mut self, start_at: Option<DateTime<Utc>>, expires_at: Option<DateTime<Utc>>) -> Self {
        self.start_at = start_at;
        self.expires_at = expires_at;
        self
    }

    /// Build and validate the stored definition.
    pub fn into_definition(self, created_by: Option<String>, now: DateTime<Utc>) -> Result<ScheduleDefinition> {
        if let Some(tz) = &self.timezone {
            if !tz.eq_ignore_ascii_case("utc") {
                return Err(CadenceError::invalid_schedule(format!(
                    "timezone '{}' is not supported; schedules are evaluated in UTC",
                    tz
                )));
            }
        }

        let kind = match (self.kind, self.interval_seconds.is_some(), self.crontab.is_some()) {
            (Some(kind), _, _) => kind,
            (None, true, false) => ScheduleKind::Interval,
            (None, false, true) => ScheduleKind::Crontab,
            (None, true, true) => {
                return Err(CadenceError::invalid_schedule(
                    "interval_seconds and crontab are mutually exclusive",
                ))
            }
            (None, false, false) => {
                return Err(CadenceError::invalid_schedule(
                    "one of interval_seconds or crontab is required",
                ))
            }
        };

        let definition = ScheduleDefinition {
            id: ScheduleId::new(),
            name: self.name.trim().to_string(),
            description: self.description,
            kind,
            interval_seconds: self.interval_seconds,
            crontab: self.crontab,
            job_name: self.job_name,
            job_args: self.job_args,
            enabled: self.enabled,
            one_off: self.one_off,
            last_fired_at: None,
            total_run_count: 0,
            start_at: self.start_at,
            expires_at: self.expires_at,
            created_by,
            created_at: now,
            updated_at: now,
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// Input of `ScheduleStore::update`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: Option<ScheduleKind>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub crontab: Option<CrontabFields>,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub job_args: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub one_off: Option<bool>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SchedulePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.kind.is_none()
            && self.interval_seconds.is_none()
            && self.crontab.is_none()
            && self.job_name.is_none()
            && self.job_args.is_none()
            && self.enabled.is_none()
            && self.one_off.is_none()
            && self.start_at.is_none()
            && self.expires_at.is_none()
    }

    /// Apply to a copy of `current` and validate the result.
    ///
    /// Supplying only the trigger field of the other kind switches the kind.
    pub fn apply(&self, current: &ScheduleDefinition, now: DateTime<Utc>) -> Result<ScheduleDefinition> {
        let mut next = current.clone();

        let kind = self.kind.unwrap_or(match (self.interval_seconds, &self.crontab) {
            (Some(_), None) => ScheduleKind::Interval,
            (None, Some(_)) => ScheduleKind::Crontab,
            _ => current.kind,
        });
        if kind != current.kind {
            next.interval_seconds = None;
            next.crontab = None;
        }
        next.kind = kind;
        if let Some(secs) = self.interval_seconds {
            next.interval_seconds = Some(secs);
        }
        if let Some(fields) = &self.crontab {
            next.crontab = Some(fields.clone());
        }

        if let Some(name) = &self.name {
            next.name = name.trim().to_string();
        }
        if let Some(description) = &self.description {
            next.description = Some(description.clone());
        }
        if let Some(job_name) = &self.job_name {
            next.job_name = job_name.clone();
        }
        if let Some(args) = &self.job_args {
            next.job_args = args.clone();
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        if let Some(one_off) = self.one_off {
            next.one_off = one_off;
        }
        if let Some(start_at) = self.start_at {
            next.start_at = Some(start_at);
        }
        if let Some(expires_at) = self.expires_at {
            next.expires_at = Some(expires_at);
        }

        next.updated_at = now;
        next.validate()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_definition() {
        let def = NewSchedule::interval("tick", 60, "increment")
            .with_args(vec![serde_json::json!(1)])
            .into_definition(Some("user-1".into()), Utc::now())
            .unwrap();

        assert_eq!(def.kind, ScheduleKind::Interval);
        assert!(def.enabled);
        assert!(def.last_fired_at.is_none());
        assert_eq!(def.created_by.as_deref(), Some("user-1"));
        assert!(matches!(def.trigger().unwrap(), Trigger::Interval(d) if d.num_seconds() == 60));
    }

    #[test]
    fn test_both_or_neither_trigger_rejected() {
        let mut both = NewSchedule::interval("x", 60, "increment");
        both.crontab = Some(CrontabFields::default());
        both.kind = None;
        assert_eq!(
            both.into_definition(None, Utc::now()).unwrap_err().code(),
            ErrorCode::InvalidSchedule
        );

        let mut neither = NewSchedule::interval("x", 60, "increment");
        neither.interval_seconds = None;
        assert!(neither.into_definition(None, Utc::now()).is_err());
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut def = NewSchedule::interval("x", 60, "increment");
        def.kind = Some(ScheduleKind::Crontab);
        assert!(def.into_definition(None, Utc::now()).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(NewSchedule::interval("x", 0, "increment")
            .into_definition(None, Utc::now())
            .is_err());
    }

    #[test]
    fn test_oversized_interval_rejected() {
        for secs in [MAX_INTERVAL_SECS + 1, 10_000_000_000_000_000, i64::MAX as u64, u64::MAX] {
            let err = NewSchedule::interval("x", secs, "increment")
                .into_definition(None, Utc::now())
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidSchedule, "{}", secs);
        }
        assert!(NewSchedule::interval("x", MAX_INTERVAL_SECS, "increment")
            .into_definition(None, Utc::now())
            .is_ok());
    }

    #[test]
    fn test_out_of_range_crontab_rejected() {
        let fields = CrontabFields::default().hour("24");
        let err = NewSchedule::crontab("x", fields, "increment")
            .into_definition(None, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCrontab);
    }

    #[test]
    fn test_non_utc_timezone_rejected() {
        let mut def = NewSchedule::crontab("x", CrontabFields::default(), "increment");
        def.timezone = Some("Europe/Paris".into());
        assert!(def.clone().into_definition(None, Utc::now()).is_err());

        def.timezone = Some("UTC".into());
        assert!(def.into_definition(None, Utc::now()).is_ok());
    }

    #[test]
    fn test_crontab_line_parsing() {
        let fields: CrontabFields = "*/15 9-17 * * 1-5".parse().unwrap();
        assert_eq!(fields.minute, "*/15");
        assert_eq!(fields.day_of_week, "1-5");
        assert_eq!(fields.to_string(), "*/15 9-17 * * 1-5");
        assert!("* * *".parse::<CrontabFields>().is_err());
    }

    #[test]
    fn test_patch_switches_kind() {
        let now = Utc::now();
        let def = NewSchedule::interval("x", 60, "increment")
            .into_definition(None, now)
            .unwrap();

        let patch = SchedulePatch {
            crontab: Some(CrontabFields::default().minute("0")),
            ..Default::default()
        };
        let next = patch.apply(&def, now).unwrap();
        assert_eq!(next.kind, ScheduleKind::Crontab);
        assert!(next.interval_seconds.is_none());
        assert_eq!(next.id, def.id);
    }

    #[test]
    fn test_invalid_patch_rejected() {
        let now = Utc::now();
        let def = NewSchedule::interval("x", 60, "increment")
            .into_definition(None, now)
            .unwrap();

        let patch = SchedulePatch {
            interval_seconds: Some(0),
            ..Default::default()
        };
        assert!(patch.apply(&def, now).is_err());
    }

    #[test]
    fn test_activity_window() {
        let now = Utc::now();
        let def = NewSchedule::interval("x", 60, "increment")
            .active_between(Some(now), Some(now + chrono::Duration::hours(1)))
            .into_definition(None, now)
            .unwrap();

        assert!(!def.is_active_at(now - chrono::Duration::seconds(1)));
        assert!(def.is_active_at(now));
        assert!(!def.is_active_at(now + chrono::Duration::hours(1)));
    }
}
