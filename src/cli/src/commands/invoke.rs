//! Invocation commands.
//!
//! Submit a registered job now or later, poll its state, wait for a
//! terminal state, and cancel pending invocations.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::schedule::parse_args;
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum InvokeCommands {
    /// Submit a job for execution
    Submit {
        /// Registered job name
        job: String,

        /// Positional job argument as JSON; repeat for more
        #[arg(short, long = "arg", value_name = "JSON")]
        args: Vec<String>,

        /// Run no earlier than this instant (RFC 3339)
        #[arg(long, conflicts_with = "countdown")]
        eta: Option<DateTime<Utc>>,

        /// Run no earlier than this many seconds from now
        #[arg(long, value_name = "SECONDS")]
        countdown: Option<u64>,

        /// Block until the invocation reaches a terminal state
        #[arg(short, long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60", requires = "wait")]
        timeout: u64,
    },

    /// Show an invocation
    Status {
        /// Invocation ID
        invocation_id: Uuid,
    },

    /// Wait for an invocation to finish
    Wait {
        /// Invocation ID
        invocation_id: Uuid,

        /// Give up after this many seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Cancel a pending invocation
    Cancel {
        /// Invocation ID
        invocation_id: Uuid,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SubmitRequest {
    job_name: String,
    args: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eta: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    countdown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
struct InvocationError {
    class: String,
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct InvocationInfo {
    id: Uuid,
    job_name: String,
    #[serde(default)]
    job_args: Vec<serde_json::Value>,
    #[serde(default)]
    schedule_id: Option<Uuid>,
    scheduled_for: String,
    state: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<InvocationError>,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    claimed_by: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
}

impl InvocationInfo {
    fn is_terminal(&self) -> bool {
        matches!(self.state.as_str(), "succeeded" | "failed" | "expired" | "cancelled")
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

const INVOCATIONS: &str = "/api/v1/invocations";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn execute(cmd: InvokeCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        InvokeCommands::Submit {
            job,
            args,
            eta,
            countdown,
            wait,
            timeout,
        } => {
            let body = SubmitRequest {
                job_name: job,
                args: parse_args(&args),
                eta,
                countdown_secs: countdown,
            };
            let invocation: InvocationInfo = client.post(INVOCATIONS, &body).await?;

            if wait {
                if matches!(format, OutputFormat::Table) {
                    output::print_info(&format!("Submitted {}, waiting...", invocation.id));
                }
                let finished = wait_for(client, invocation.id, Duration::from_secs(timeout)).await?;
                report(&finished, format)?;
            } else {
                match format {
                    OutputFormat::Table => {
                        output::print_success("Invocation submitted");
                        output::print_detail("ID", &invocation.id.to_string());
                        output::print_detail("Job", &invocation.job_name);
                        output::print_detail("Scheduled For", &output::short_time(Some(&invocation.scheduled_for)));
                    }
                    _ => output::print_item(&invocation, format)?,
                }
            }
        }

        InvokeCommands::Status { invocation_id } => {
            let invocation = fetch(client, invocation_id).await?;
            report(&invocation, format)?;
        }

        InvokeCommands::Wait { invocation_id, timeout } => {
            let finished = wait_for(client, invocation_id, Duration::from_secs(timeout)).await?;
            report(&finished, format)?;
        }

        InvokeCommands::Cancel { invocation_id } => {
            let invocation: InvocationInfo = client
                .post(
                    &format!("{}/{}/cancel", INVOCATIONS, invocation_id),
                    &serde_json::json!({}),
                )
                .await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Invocation {} cancelled", invocation.id)),
                _ => output::print_item(&invocation, format)?,
            }
        }
    }

    Ok(())
}

async fn fetch(client: &ApiClient, id: Uuid) -> Result<InvocationInfo> {
    client.get(&format!("{}/{}", INVOCATIONS, id)).await
}

/// Poll until the invocation is terminal or `timeout` elapses.
async fn wait_for(client: &ApiClient, id: Uuid, timeout: Duration) -> Result<InvocationInfo> {
    let started = Instant::now();
    loop {
        let invocation = fetch(client, id).await?;
        if invocation.is_terminal() {
            return Ok(invocation);
        }
        if started.elapsed() >= timeout {
            anyhow::bail!(
                "Timed out after {}s; invocation {} is still {}",
                timeout.as_secs(),
                id,
                invocation.state
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn report(invocation: &InvocationInfo, format: OutputFormat) -> Result<()> {
    if !matches!(format, OutputFormat::Table) {
        return output::print_item(invocation, format);
    }

    output::print_header(&format!("Invocation: {}", invocation.id));
    output::print_detail("Job", &invocation.job_name);
    output::print_detail("State", &output::state_label(&invocation.state).to_string());
    if let Some(schedule_id) = invocation.schedule_id {
        output::print_detail("Schedule", &schedule_id.to_string());
    }
    output::print_detail("Scheduled For", &output::short_time(Some(&invocation.scheduled_for)));
    output::print_detail("Attempts", &invocation.attempts.to_string());
    if let Some(worker) = &invocation.claimed_by {
        output::print_detail("Worker", worker);
    }
    output::print_detail("Started", &output::short_time(invocation.started_at.as_deref()));
    output::print_detail("Finished", &output::short_time(invocation.finished_at.as_deref()));
    if let Some(result) = &invocation.result {
        output::print_detail("Result", &result.to_string());
    }
    if let Some(error) = &invocation.error {
        let code = error.code.as_deref().map(|c| format!(" [{}]", c)).unwrap_or_default();
        output::print_detail(
            "Error",
            &format!("{}: {}{}", error.class, error.message, code).red().to_string(),
        );
    }
    Ok(())
}
