use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::logging::{self, LogFormat, LogOptions};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Staged workflow orchestrator")]
pub struct Cli {
    /// Debug-level logging and per-stage detail in the run summary
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,

    /// Also write JSON logs to a daily-rotated file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Directory holding conductor.toml (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline file and print its routing table
    Validate {
        /// Path to the file (defaults to conductor.toml in the project directory)
        file: Option<PathBuf>,
    },
    /// Run the built-in weather alert pipeline with simulated stages and channels
    Demo {
        /// Pipeline file to use instead of the built-in one
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run input as JSON, e.g. '{"location": "Oslo", "days": 5}'
        #[arg(short, long)]
        input: Option<String>,

        /// Simulate an outage on this delivery channel
        #[arg(long)]
        fail_channel: Option<String>,

        /// Transient failures the forecast stage reports before succeeding
        #[arg(long, default_value = "1")]
        forecast_failures: u32,

        /// Simulated latency per stage and per channel send
        #[arg(long, default_value = "120")]
        latency_ms: u64,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// View or scaffold configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default conductor.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        format: cli.log_format,
        log_dir: cli.log_dir.clone(),
    })?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Validate { file } => cmd::cmd_validate(&project_dir, file.as_deref())?,
        Commands::Demo {
            config,
            input,
            fail_channel,
            forecast_failures,
            latency_ms,
            ui,
        } => {
            cmd::cmd_demo(
                &project_dir,
                cmd::demo::DemoArgs {
                    config: config.as_deref(),
                    input: input.as_deref(),
                    fail_channel: fail_channel.as_deref(),
                    forecast_failures: *forecast_failures,
                    latency_ms: *latency_ms,
                    ui,
                    verbose: cli.verbose,
                },
            )
            .await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
