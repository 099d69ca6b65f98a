//! Cadence CLI - Command-line interface for the Cadence job scheduler.
//!
//! Provides commands for schedules, invocations, health, and configuration.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, invoke, schedule};
use output::OutputFormat;

/// Cadence - periodic and delayed job scheduler CLI
#[derive(Parser)]
#[command(
    name = "cadence",
    author = "Aezi <aezi.zhu@icloud.com>",
    version,
    about = "Cadence - periodic and delayed job scheduler",
    long_about = "CLI tool for managing Cadence schedules, submitting jobs and inspecting their results.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "CADENCE_API_URL")]
    api_url: Option<String>,

    /// Identity recorded on created schedules
    #[arg(long, global = true, env = "CADENCE_USER")]
    user: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule management operations
    #[command(subcommand)]
    Schedule(schedule::ScheduleCommands),

    /// Submit and inspect job invocations
    #[command(subcommand)]
    Invoke(invoke::InvokeCommands),

    /// Check server health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(|| config::load_value("api-url"))
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let user = cli.user.clone().or_else(|| config::load_value("user"));

    let client = client::ApiClient::new(&api_url)?.with_user(user);
    let format = cli.output;

    let result = match cli.command {
        Commands::Schedule(cmd) => schedule::execute(cmd, &client, format).await,
        Commands::Invoke(cmd) => invoke::execute(cmd, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
