//! Five-field crontab matching in UTC.
//!
//! Each field accepts `*`, `N`, `A-B`, `*/S`, `A-B/S`, `N/S` (N to the field
//! maximum in steps of S) and comma-separated lists of those. Day-of-week runs
//! 0-6 with 0 = Sunday. When both day-of-month and day-of-week are restricted,
//! a day matches if either does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

use super::schedule::CrontabFields;
use crate::error::{CadenceError, Result};

/// Upper bound on the search for the next matching minute.
const SEARCH_HORIZON_YEARS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day_of_month",
            Self::Month => "month",
            Self::DayOfWeek => "day_of_week",
        }
    }

    /// Inclusive range of legal values.
    pub fn bounds(&self) -> (u32, u32) {
        match self {
            Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 6),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field Set
// ═══════════════════════════════════════════════════════════════════════════════

/// Set of values one field matches, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSet {
    bits: u64,
    full: bool,
}

impl FieldSet {
    pub fn parse(field: Field, expression: &str) -> Result<Self> {
        let (min, max) = field.bounds();
        let fail = |reason: String| CadenceError::invalid_crontab(field.name(), expression, reason);

        let expression = expression.trim();
        if expression.is_empty() {
            return Err(fail("empty expression".into()));
        }

        let mut bits = 0u64;
        for part in expression.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(fail("empty list element".into()));
            }

            let (base, step) = match part.split_once('/') {
                Some((base, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| fail(format!("invalid step '{}'", step)))?;
                    if step == 0 {
                        return Err(fail("step must be positive".into()));
                    }
                    if step > max - min + 1 {
                        return Err(fail(format!("step must be at most {}", max - min + 1)));
                    }
                    (base, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                let a = parse_value(a).ok_or_else(|| fail(format!("invalid value '{}'", a)))?;
                let b = parse_value(b).ok_or_else(|| fail(format!("invalid value '{}'", b)))?;
                if a > b {
                    return Err(fail(format!("range {}-{} is reversed", a, b)));
                }
                (a, b)
            } else {
                let n = parse_value(base).ok_or_else(|| fail(format!("invalid value '{}'", base)))?;
                if step.is_some() { (n, max) } else { (n, n) }
            };

            if start < min || end > max {
                return Err(fail(format!("values must be within {}-{}", min, max)));
            }

            let step = step.unwrap_or(1);
            let mut value = Some(start);
            while let Some(v) = value.filter(|v| *v <= end) {
                bits |= 1 << v;
                value = v.checked_add(step);
            }
        }

        let full_mask = (min..=max).fold(0u64, |acc, v| acc | (1 << v));
        Ok(Self {
            bits,
            full: bits == full_mask,
        })
    }

    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    /// Matches every legal value.
    pub fn is_full(&self) -> bool {
        self.full
    }
}

fn parse_value(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Expression
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed crontab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronExpr {
    pub fn parse(fields: &CrontabFields) -> Result<Self> {
        Ok(Self {
            minute: FieldSet::parse(Field::Minute, &fields.minute)?,
            hour: FieldSet::parse(Field::Hour, &fields.hour)?,
            day_of_month: FieldSet::parse(Field::DayOfMonth, &fields.day_of_month)?,
            month: FieldSet::parse(Field::Month, &fields.month)?,
            day_of_week: FieldSet::parse(Field::DayOfWeek, &fields.day_of_week)?,
        })
    }

    /// Whether the minute containing `at` matches all five fields.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.contains(at.minute())
            && self.hour.contains(at.hour())
            && self.month.contains(at.month())
            && self.day_matches(at.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self.day_of_week.contains(date.weekday().num_days_from_sunday());
        match (self.day_of_month.is_full(), self.day_of_week.is_full()) {
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }

    /// First matching minute boundary strictly after `after`.
    ///
    /// Returns `None` for expressions that can never match, such as
    /// February 30th.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let horizon = after.year() + SEARCH_HORIZON_YEARS;
        let mut at = floor_to_minute(after).checked_add_signed(Duration::minutes(1))?;

        while at.year() <= horizon {
            if !self.month.contains(at.month()) {
                at = start_of_next_month(at)?;
                continue;
            }
            if !self.day_matches(at.date_naive()) {
                at = start_of_next_day(at)?;
                continue;
            }
            if !self.hour.contains(at.hour()) {
                at = floor_to_hour(at).checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if !self.minute.contains(at.minute()) {
                at = at.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return Some(at);
        }
        None
    }
}

/// Truncate to the start of the containing minute.
pub fn floor_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at - Duration::seconds(at.second() as i64) - Duration::nanoseconds(at.nanosecond() as i64)
}

fn floor_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_minute(at) - Duration::minutes(at.minute() as i64)
}

fn start_of_next_day(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(at.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}
