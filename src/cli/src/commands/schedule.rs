//! Schedule management commands.
//!
//! Provides create, list, show, update, enable and disable operations.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Create a schedule
    Create(CreateArgs),

    /// List all schedules
    List {
        /// Only show enabled schedules
        #[arg(long)]
        enabled: bool,
    },

    /// Show one schedule with its next fire time
    #[command(visible_alias = "get")]
    Show {
        /// Schedule ID
        schedule_id: Uuid,
    },

    /// Change fields of a schedule
    Update(UpdateArgs),

    /// Re-enable a disabled schedule
    Enable {
        /// Schedule ID
        schedule_id: Uuid,
    },

    /// Disable a schedule (its history is kept)
    Disable {
        /// Schedule ID
        schedule_id: Uuid,
    },
}

#[derive(Args)]
#[command(group(ArgGroup::new("trigger").required(true).args(["every", "cron"])))]
pub struct CreateArgs {
    /// Unique schedule name
    #[arg(short, long)]
    name: String,

    /// Registered job to run
    #[arg(short, long)]
    job: String,

    /// Fire every N seconds
    #[arg(long, value_name = "SECONDS")]
    every: Option<u64>,

    /// Five-field crontab line, evaluated in UTC (e.g. "*/15 * * * *")
    #[arg(long, value_name = "EXPR")]
    cron: Option<String>,

    /// Positional job argument as JSON; repeat for more
    #[arg(short, long = "arg", value_name = "JSON")]
    args: Vec<String>,

    #[arg(short, long)]
    description: Option<String>,

    /// Disable after the first dispatch
    #[arg(long)]
    one_off: bool,

    /// Create disabled
    #[arg(long)]
    disabled: bool,

    /// Not due before this instant (RFC 3339)
    #[arg(long)]
    start_at: Option<DateTime<Utc>>,

    /// Not due at or after this instant (RFC 3339)
    #[arg(long)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Schedule ID
    schedule_id: Uuid,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    job: Option<String>,

    /// Switch to an interval trigger
    #[arg(long, value_name = "SECONDS", conflicts_with = "cron")]
    every: Option<u64>,

    /// Switch to a crontab trigger
    #[arg(long, value_name = "EXPR")]
    cron: Option<String>,

    /// Replace the job arguments; repeat for more
    #[arg(short, long = "arg", value_name = "JSON")]
    args: Vec<String>,

    #[arg(long)]
    description: Option<String>,

    #[arg(long)]
    start_at: Option<DateTime<Utc>>,

    #[arg(long)]
    expires_at: Option<DateTime<Utc>>,
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Crontab {
    minute: String,
    hour: String,
    day_of_month: String,
    month: String,
    day_of_week: String,
}

impl Crontab {
    /// Parse a `minute hour day-of-month month day-of-week` line.
    fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
            anyhow::bail!("crontab needs exactly 5 fields, got {}: '{}'", fields.len(), line);
        };
        Ok(Self {
            minute: minute.to_string(),
            hour: hour.to_string(),
            day_of_month: day_of_month.to_string(),
            month: month.to_string(),
            day_of_week: day_of_week.to_string(),
        })
    }

    fn line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

#[derive(Serialize)]
struct CreateScheduleRequest {
    name: String,
    job_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crontab: Option<Crontab>,
    job_args: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    enabled: bool,
    one_off: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize)]
struct SchedulePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crontab: Option<Crontab>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_args: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ScheduleInfo {
    id: Uuid,
    name: String,
    #[serde(default)]
    description: Option<String>,
    kind: String,
    #[serde(default)]
    interval_seconds: Option<u64>,
    #[serde(default)]
    crontab: Option<Crontab>,
    job_name: String,
    #[serde(default)]
    job_args: Vec<serde_json::Value>,
    enabled: bool,
    #[serde(default)]
    one_off: bool,
    #[serde(default)]
    last_fired_at: Option<String>,
    #[serde(default)]
    total_run_count: u64,
    #[serde(default)]
    start_at: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    created_by: Option<String>,
    #[serde(default)]
    next_fire_at: Option<String>,
}

impl ScheduleInfo {
    fn trigger(&self) -> String {
        match (&self.interval_seconds, &self.crontab) {
            (Some(secs), _) => format!("every {}s", secs),
            (None, Some(cron)) => cron.line(),
            (None, None) => "-".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct ScheduleRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Trigger")]
    trigger: String,
    #[tabled(rename = "Job")]
    job: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Runs")]
    runs: u64,
    #[tabled(rename = "Last Fired")]
    last_fired: String,
    #[tabled(rename = "Next Fire")]
    next_fire: String,
}

impl From<&ScheduleInfo> for ScheduleRow {
    fn from(s: &ScheduleInfo) -> Self {
        let state = if s.enabled { "enabled" } else { "disabled" };
        Self {
            id: s.id.to_string()[..8].to_string(),
            name: s.name.clone(),
            trigger: s.trigger(),
            job: s.job_name.clone(),
            state: output::state_label(state).to_string(),
            runs: s.total_run_count,
            last_fired: output::short_time(s.last_fired_at.as_deref()),
            next_fire: output::short_time(s.next_fire_at.as_deref()),
        }
    }
}

/// Parse `--arg` values as JSON, falling back to plain strings.
pub fn parse_args(raw: &[String]) -> Vec<serde_json::Value> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| serde_json::Value::String(arg.clone())))
        .collect()
}

// ── Execution ───────────────────────────────────────────────────────────────

const SCHEDULES: &str = "/api/v1/schedules";

pub async fn execute(cmd: ScheduleCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        ScheduleCommands::Create(args) => {
            let crontab = args.cron.as_deref().map(Crontab::parse).transpose()?;
            let body = CreateScheduleRequest {
                name: args.name,
                job_name: args.job,
                interval_seconds: args.every,
                crontab,
                job_args: parse_args(&args.args),
                description: args.description,
                enabled: !args.disabled,
                one_off: args.one_off,
                start_at: args.start_at,
                expires_at: args.expires_at,
            };

            let schedule: ScheduleInfo = client.post(SCHEDULES, &body).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Schedule '{}' created", schedule.name));
                    print_schedule(&schedule);
                }
                _ => output::print_item(&schedule, format)?,
            }
        }

        ScheduleCommands::List { enabled } => {
            let schedules: Vec<ScheduleInfo> = client.get(SCHEDULES).await?;
            let schedules: Vec<ScheduleInfo> = schedules
                .into_iter()
                .filter(|s| !enabled || s.enabled)
                .collect();

            match format {
                OutputFormat::Table => {
                    let rows: Vec<ScheduleRow> = schedules.iter().map(ScheduleRow::from).collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&schedules, format)?,
            }
        }

        ScheduleCommands::Show { schedule_id } => {
            let schedule: ScheduleInfo = client.get(&format!("{}/{}", SCHEDULES, schedule_id)).await?;
            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Schedule: {}", schedule.name));
                    print_schedule(&schedule);
                }
                _ => output::print_item(&schedule, format)?,
            }
        }

        ScheduleCommands::Update(args) => {
            let patch = build_patch(&args)?;
            let schedule: ScheduleInfo = client
                .put(&format!("{}/{}", SCHEDULES, args.schedule_id), &patch)
                .await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Schedule '{}' updated", schedule.name));
                    print_schedule(&schedule);
                }
                _ => output::print_item(&schedule, format)?,
            }
        }

        ScheduleCommands::Enable { schedule_id } => {
            let patch = SchedulePatch {
                enabled: Some(true),
                ..SchedulePatch::default()
            };
            let schedule: ScheduleInfo = client.put(&format!("{}/{}", SCHEDULES, schedule_id), &patch).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Schedule '{}' enabled", schedule.name)),
                _ => output::print_item(&schedule, format)?,
            }
        }

        ScheduleCommands::Disable { schedule_id } => {
            let schedule: ScheduleInfo = client.delete(&format!("{}/{}", SCHEDULES, schedule_id)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Schedule '{}' disabled", schedule.name)),
                _ => output::print_item(&schedule, format)?,
            }
        }
    }

    Ok(())
}

fn build_patch(args: &UpdateArgs) -> Result<SchedulePatch> {
    let crontab = args
        .cron
        .as_deref()
        .map(Crontab::parse)
        .transpose()
        .context("Invalid --cron")?;

    // The server drops the other trigger field when the kind changes.
    let kind = match (args.every, &crontab) {
        (Some(_), _) => Some("interval"),
        (None, Some(_)) => Some("crontab"),
        (None, None) => None,
    };

    let patch = SchedulePatch {
        name: args.name.clone(),
        description: args.description.clone(),
        kind,
        interval_seconds: args.every,
        crontab,
        job_name: args.job.clone(),
        job_args: (!args.args.is_empty()).then(|| parse_args(&args.args)),
        enabled: None,
        start_at: args.start_at,
        expires_at: args.expires_at,
    };

    let empty = serde_json::to_value(&patch)?
        .as_object()
        .map(|fields| fields.is_empty())
        .unwrap_or(true);
    if empty {
        anyhow::bail!("Nothing to update; pass at least one field");
    }
    Ok(patch)
}

fn print_schedule(s: &ScheduleInfo) {
    output::print_detail("ID", &s.id.to_string());
    output::print_detail("Kind", &s.kind);
    output::print_detail("Trigger", &s.trigger());
    output::print_detail("Job", &s.job_name);
    if !s.job_args.is_empty() {
        output::print_detail("Args", &serde_json::Value::Array(s.job_args.clone()).to_string());
    }
    if let Some(description) = &s.description {
        output::print_detail("Description", description);
    }
    let state = if s.enabled { "enabled" } else { "disabled" };
    output::print_detail("State", &output::state_label(state).to_string());
    if s.one_off {
        output::print_detail("One-off", "yes");
    }
    output::print_detail("Runs", &s.total_run_count.to_string());
    output::print_detail("Last Fired", &output::short_time(s.last_fired_at.as_deref()));
    output::print_detail("Next Fire", &output::short_time(s.next_fire_at.as_deref()));
    if s.start_at.is_some() || s.expires_at.is_some() {
        output::print_detail(
            "Window",
            &format!(
                "{} .. {}",
                output::short_time(s.start_at.as_deref()),
                output::short_time(s.expires_at.as_deref())
            ),
        );
    }
    if let Some(user) = &s.created_by {
        output::print_detail("Created By", user);
    }
}
