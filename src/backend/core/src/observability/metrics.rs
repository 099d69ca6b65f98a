//! Scheduler metrics and the Prometheus recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::jobs::InvocationState;

/// Install the global Prometheus recorder and describe all metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(handle)
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "cadence_dispatches_total",
        "Job invocations submitted, by origin (schedule, ad_hoc, delayed)"
    );
    describe_counter!(
        "cadence_invocations_total",
        "Invocations reaching a terminal state, by state"
    );
    describe_counter!("cadence_job_retries_total", "Retry attempts made by executors");
    describe_counter!(
        "cadence_invocations_expired_total",
        "Invocations that were never claimed inside their visibility window"
    );
    describe_counter!(
        "cadence_invocations_reclaimed_total",
        "Running invocations whose claim lapsed and were requeued"
    );
    describe_counter!("cadence_beat_ticks_total", "Evaluator ticks, by leadership");
    describe_counter!("cadence_errors_total", "Errors constructed, by code");

    describe_gauge!("cadence_queue_depth", "Invocation ids waiting in the queue");
    describe_gauge!("cadence_executor_active", "Jobs currently executing");

    describe_histogram!("cadence_job_duration_seconds", "Job execution duration in seconds");
}

pub fn record_dispatch(origin: &'static str, job: &str) {
    counter!("cadence_dispatches_total", "origin" => origin, "job" => job.to_string()).increment(1);
}

pub fn record_terminal(state: InvocationState, job: &str, duration_secs: f64) {
    counter!(
        "cadence_invocations_total",
        "state" => state.as_str(),
        "job" => job.to_string()
    )
    .increment(1);
    histogram!("cadence_job_duration_seconds", "job" => job.to_string()).record(duration_secs);
}

pub fn record_retry(job: &str) {
    counter!("cadence_job_retries_total", "job" => job.to_string()).increment(1);
}

pub fn record_expired(count: u64) {
    counter!("cadence_invocations_expired_total").increment(count);
}

pub fn record_reclaimed(count: u64) {
    counter!("cadence_invocations_reclaimed_total").increment(count);
}

pub fn record_tick(leader: bool) {
    counter!("cadence_beat_ticks_total", "leader" => leader.to_string()).increment(1);
}

pub fn set_queue_depth(depth: usize) {
    gauge!("cadence_queue_depth").set(depth as f64);
}

pub fn set_active_executions(active: u64) {
    gauge!("cadence_executor_active").set(active as f64);
}
