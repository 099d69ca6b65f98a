//! Benchmarks for due-task evaluation and crontab search.
use cadence_core::jobs::{
    next_fire_time, CronExpr, CrontabFields, DueTaskEvaluator, InMemoryResultStore, JobInvocation,
    InvocationId, NewSchedule, ResultStore, ScheduleDefinition,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
}

fn mixed_schedules(n: usize) -> Vec<ScheduleDefinition> {
    let crontabs = [
        CrontabFields::default().minute("*/5"),
        CrontabFields::default().minute("0").hour("9-17").day_of_week("1-5"),
        CrontabFields::default().minute("30").hour("2").day_of_month("1,15"),
    ];
    (0..n)
        .map(|i| {
            let new = if i % 2 == 0 {
                NewSchedule::interval(format!("interval-{i}"), 30 + (i as u64 % 600), "increment")
            } else {
                NewSchedule::crontab(format!("crontab-{i}"), crontabs[i % crontabs.len()].clone(), "increment")
            };
            let mut def = new.into_definition(None, base()).unwrap();
            if i % 3 == 0 {
                def.last_fired_at = Some(base() - Duration::seconds(i as i64 % 900));
            }
            def
        })
        .collect()
}

fn bench_evaluate_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate_snapshot");
    for n in [100, 1_000, 10_000] {
        let schedules = mixed_schedules(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &schedules, |b, s| { b.iter(|| black_box(DueTaskEvaluator::evaluate(s, base()))); });
    }
    group.finish();
}

fn bench_crontab_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("crontab_parse");
    for (label, fields) in [
        ("wildcards", CrontabFields::default()),
        ("stepped", CrontabFields::default().minute("*/7").hour("*/3")),
        ("lists", CrontabFields::default().minute("0,15,30,45").hour("1,5,9,13,17,21").day_of_week("1,3,5")),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(label), &fields, |b, f| { b.iter(|| black_box(CronExpr::parse(f).unwrap())); });
    }
    group.finish();
}

fn bench_crontab_next_after(c: &mut Criterion) {
    let mut group = c.benchmark_group("crontab_next_after");
    for (label, fields) in [
        ("every_minute", CrontabFields::default()),
        ("weekday_mornings", CrontabFields::default().minute("0").hour("9").day_of_week("1-5")),
        ("yearly", CrontabFields::default().minute("0").hour("0").day_of_month("1").month("1")),
        ("leap_day", CrontabFields::default().minute("0").hour("0").day_of_month("29").month("2")),
    ] {
        let expr = CronExpr::parse(&fields).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(label), &expr, |b, e| { b.iter(|| black_box(e.next_after(base()))); });
    }
    group.finish();
}

fn bench_next_fire_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_fire_time");
    let schedules = mixed_schedules(1_000);
    group.throughput(Throughput::Elements(schedules.len() as u64));
    group.bench_function("mixed_1000", |b| { b.iter(|| { for s in &schedules { black_box(next_fire_time(s, base()).unwrap()); } }); });
    group.finish();
}

fn bench_result_store_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_store_claim");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for n in [100, 1_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| { rt.block_on(async {
                let store = InMemoryResultStore::new();
                let mut ids = Vec::with_capacity(n);
                for _ in 0..n {
                    let id = InvocationId::new();
                    store.insert(JobInvocation::pending(id, "increment", vec![], base(), Duration::hours(1), base()).unwrap()).await.unwrap();
                    ids.push(id);
                }
                for id in ids { black_box(store.try_claim(id, "bench", base(), Duration::minutes(5)).await.unwrap()); }
            }); });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_evaluate_snapshot, bench_crontab_parse, bench_crontab_next_after, bench_next_fire_time, bench_result_store_claim);
criterion_main!(benches);
