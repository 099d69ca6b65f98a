//! Crontab matching and next-fire computation.
//!
//! Tests cover:
//! - Field syntax: wildcards, ranges, steps, lists
//! - Rejection of malformed and out-of-range fields
//! - Day-of-month / day-of-week combination
//! - Next matching minute across hour, day, month and year boundaries
//! - Next fire time of stored schedules, honoring activity windows

use cadence_core::error::ErrorCode;
use cadence_core::jobs::crontab::{floor_to_minute, Field, FieldSet};
use cadence_core::jobs::{next_fire_time, CronExpr, CrontabFields, NewSchedule, ScheduleDefinition};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

fn expr(fields: CrontabFields) -> CronExpr {
    CronExpr::parse(&fields).unwrap()
}

// ============================================================================
// Field Syntax
// ============================================================================

#[test]
fn test_field_forms() {
    let stepped = FieldSet::parse(Field::Minute, "*/15").unwrap();
    for m in [0, 15, 30, 45] {
        assert!(stepped.contains(m));
    }
    assert!(!stepped.contains(10));

    let range = FieldSet::parse(Field::Hour, "9-17").unwrap();
    assert!(range.contains(9) && range.contains(17));
    assert!(!range.contains(18));

    let list = FieldSet::parse(Field::DayOfWeek, "1,3,5").unwrap();
    assert!(list.contains(3));
    assert!(!list.contains(2));

    let offset = FieldSet::parse(Field::Minute, "5/20").unwrap();
    assert!(offset.contains(5) && offset.contains(25) && offset.contains(45));
    assert!(!offset.contains(0));

    let range_step = FieldSet::parse(Field::Hour, "0-12/6").unwrap();
    assert!(range_step.contains(0) && range_step.contains(6) && range_step.contains(12));
    assert!(!range_step.contains(18));
}

#[test]
fn test_full_field_detection() {
    assert!(FieldSet::parse(Field::DayOfMonth, "*").unwrap().is_full());
    assert!(FieldSet::parse(Field::DayOfWeek, "0-6").unwrap().is_full());
    assert!(!FieldSet::parse(Field::DayOfWeek, "1-5").unwrap().is_full());
}

#[test]
fn test_malformed_fields_rejected() {
    let cases = [
        (Field::Minute, ""),
        (Field::Minute, "60"),
        (Field::Hour, "24"),
        (Field::DayOfMonth, "0"),
        (Field::Month, "13"),
        (Field::DayOfWeek, "7"),
        (Field::Minute, "*/0"),
        (Field::Minute, "10-5"),
        (Field::Minute, "1,,2"),
        (Field::Hour, "noon"),
        (Field::Minute, "-5"),
        (Field::Minute, "59/4294967295"),
        (Field::Minute, "*/4294967295"),
        (Field::Hour, "0-23/25"),
        (Field::Minute, "*/61"),
        (Field::Minute, "99999999999"),
    ];

    for (field, raw) in cases {
        let err = FieldSet::parse(field, raw).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCrontab, "{:?} '{}'", field, raw);
    }
}

#[test]
fn test_step_spanning_whole_field_keeps_start_only() {
    let set = FieldSet::parse(Field::Minute, "59/60").unwrap();
    assert!(set.contains(59));
    assert!((0..59).all(|m| !set.contains(m)));

    let set = FieldSet::parse(Field::Hour, "*/24").unwrap();
    assert!(set.contains(0));
    assert!((1..24).all(|h| !set.contains(h)));
}

// ============================================================================
// Matching
// ============================================================================

#[test]
fn test_matching_ignores_seconds() {
    let every_quarter = expr(CrontabFields::default().minute("*/15"));
    assert!(every_quarter.matches(at(2024, 3, 4, 10, 15) + Duration::seconds(42)));
    assert!(!every_quarter.matches(at(2024, 3, 4, 10, 16)));
}

#[test]
fn test_day_of_week_zero_is_sunday() {
    let sundays = expr(CrontabFields::default().minute("0").hour("0").day_of_week("0"));
    // 2024-03-03 is a Sunday.
    assert!(sundays.matches(at(2024, 3, 3, 0, 0)));
    assert!(!sundays.matches(at(2024, 3, 4, 0, 0)));
}

#[test]
fn test_restricted_day_fields_combine_with_or() {
    // First of the month, or any Friday.
    let fields = CrontabFields::default()
        .minute("0")
        .hour("12")
        .day_of_month("1")
        .day_of_week("5");
    let cron = expr(fields);

    assert!(cron.matches(at(2024, 3, 1, 12, 0))); // Friday the 1st
    assert!(cron.matches(at(2024, 4, 1, 12, 0))); // Monday the 1st
    assert!(cron.matches(at(2024, 4, 5, 12, 0))); // Friday the 5th
    assert!(!cron.matches(at(2024, 4, 4, 12, 0)));
}

#[test]
fn test_single_restricted_day_field_must_match() {
    let weekdays = expr(CrontabFields::default().minute("30").hour("9").day_of_week("1-5"));
    assert!(weekdays.matches(at(2024, 3, 4, 9, 30)));
    assert!(!weekdays.matches(at(2024, 3, 9, 9, 30)));
}

// ============================================================================
// Next Matching Minute
// ============================================================================

#[test]
fn test_next_after_is_strict() {
    let hourly = expr(CrontabFields::default().minute("0"));
    assert_eq!(hourly.next_after(at(2024, 3, 4, 10, 0)), Some(at(2024, 3, 4, 11, 0)));
    assert_eq!(
        hourly.next_after(at(2024, 3, 4, 10, 59) + Duration::seconds(59)),
        Some(at(2024, 3, 4, 11, 0))
    );
}

#[test]
fn test_next_after_crosses_boundaries() {
    let new_year = expr(CrontabFields::default().minute("0").hour("0").day_of_month("1").month("1"));
    assert_eq!(new_year.next_after(at(2024, 3, 4, 10, 0)), Some(at(2025, 1, 1, 0, 0)));

    let month_end = expr(CrontabFields::default().minute("59").hour("23").day_of_month("31"));
    assert_eq!(month_end.next_after(at(2024, 4, 1, 0, 0)), Some(at(2024, 5, 31, 23, 59)));
}

#[test]
fn test_next_after_leap_day() {
    let leap = expr(CrontabFields::default().minute("0").hour("0").day_of_month("29").month("2"));
    assert_eq!(leap.next_after(at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 0, 0)));
}

#[test]
fn test_impossible_date_never_matches() {
    let never = expr(CrontabFields::default().day_of_month("30").month("2"));
    assert_eq!(never.next_after(at(2024, 1, 1, 0, 0)), None);
}

#[test]
fn test_floor_to_minute() {
    let t = at(2024, 3, 4, 10, 15) + Duration::milliseconds(59_999);
    assert_eq!(floor_to_minute(t), at(2024, 3, 4, 10, 15));
}

// ============================================================================
// Next Fire Time
// ============================================================================

fn schedule(new: NewSchedule, now: DateTime<Utc>) -> ScheduleDefinition {
    new.into_definition(None, now).unwrap()
}

#[test]
fn test_next_fire_time_interval() {
    let now = at(2024, 3, 4, 10, 0);
    let mut def = schedule(NewSchedule::interval("i", 300, "increment"), now);
    assert_eq!(next_fire_time(&def, now).unwrap(), Some(now));

    def.last_fired_at = Some(now);
    assert_eq!(
        next_fire_time(&def, now + Duration::seconds(1)).unwrap(),
        Some(now + Duration::seconds(300))
    );
}

#[test]
fn test_next_fire_time_crontab_after_fire() {
    let now = at(2024, 3, 4, 10, 0);
    let mut def = schedule(
        NewSchedule::crontab("c", CrontabFields::default().minute("*/10"), "increment"),
        now,
    );
    assert_eq!(next_fire_time(&def, now).unwrap(), Some(now));

    def.last_fired_at = Some(now);
    assert_eq!(
        next_fire_time(&def, now + Duration::seconds(5)).unwrap(),
        Some(at(2024, 3, 4, 10, 10))
    );
}

#[test]
fn test_next_fire_time_respects_window() {
    let now = at(2024, 3, 4, 10, 0);
    let start = at(2024, 3, 5, 0, 0);
    let def = schedule(
        NewSchedule::crontab("c", CrontabFields::default().minute("0").hour("6"), "increment")
            .active_between(Some(start), None),
        now,
    );
    assert_eq!(next_fire_time(&def, now).unwrap(), Some(at(2024, 3, 5, 6, 0)));

    let expiring = schedule(
        NewSchedule::crontab("d", CrontabFields::default().minute("0").hour("6"), "increment")
            .active_between(None, Some(start)),
        now,
    );
    assert_eq!(next_fire_time(&expiring, now).unwrap(), None);
}

#[test]
fn test_disabled_schedule_has_no_next_fire() {
    let now = at(2024, 3, 4, 10, 0);
    let def = schedule(NewSchedule::interval("i", 60, "increment").disabled(), now);
    assert_eq!(next_fire_time(&def, now).unwrap(), None);
}
