//! Health check command.
//!
//! Queries the `/health` endpoint and displays server status and the jobs it
//! can run.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Also list the registered jobs
    #[arg(short, long)]
    detailed: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: serde_json::Value = client.get_raw("/health").await?;

    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&health, format);
    }

    let status = health
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    output::print_header("Server Health");
    output::print_detail("Status", status);
    output::print_detail("API URL", client.base_url());

    if let Some(version) = health.get("version").and_then(|v| v.as_str()) {
        output::print_detail("Version", version);
    }
    if let Some(ts) = health.get("timestamp").and_then(|v| v.as_str()) {
        output::print_detail("Timestamp", ts);
    }

    if args.detailed {
        if let Some(jobs) = health.get("jobs").and_then(|v| v.as_array()) {
            output::print_header("Registered Jobs");
            for job in jobs.iter().filter_map(|j| j.as_str()) {
                println!("  {}", job);
            }
        }
    }

    if status == "healthy" {
        output::print_success("Server operational");
    } else {
        output::print_error(&format!("Server status: {}", status));
    }

    Ok(())
}
