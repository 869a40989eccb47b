use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

mod cmd;

#[derive(Parser)]
#[command(name = "baton")]
#[command(version, about = "Resumable build driver for time-boxed CI runners")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to baton.toml (defaults to .baton/baton.toml in the project directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one invocation: resume, advance the stages, publish
    Run {
        /// The caller already knows the job finished
        #[arg(long, action = ArgAction::Set, default_value_t = false)]
        finished: bool,

        /// Restore the last checkpoint before running
        #[arg(long, action = ArgAction::Set, default_value_t = false)]
        from_artifact: bool,

        /// Start of the job window (RFC 3339); defaults to now
        #[arg(long, env = "BATON_JOB_STARTED_AT")]
        job_started_at: Option<DateTime<Utc>>,
    },
    /// Show version, persisted stage and store settings
    Status,
    /// Remove the persisted stage marker
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// Print the Build stage budget at this point of the job window
    Budget {
        /// Start of the job window (RFC 3339); defaults to now
        #[arg(long, env = "BATON_JOB_STARTED_AT")]
        job_started_at: Option<DateTime<Utc>>,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
    /// Write a commented starter baton.toml
    Init,
}

/// Stderr logging (text or JSON), plus a daily log file when `log_dir` is given.
fn init_tracing(verbose: bool, json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (json_layer, text_layer) = if json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (
            None,
            Some(fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )
    };

    let (file_layer, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "baton.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = match cli.command {
        Commands::Run { .. } => Some(project_dir.join(".baton").join("logs")),
        _ => None,
    };
    let _log_guard = init_tracing(cli.verbose, cli.log_json, log_dir.as_deref());

    match &cli.command {
        Commands::Run {
            finished,
            from_artifact,
            job_started_at,
        } => {
            cmd::cmd_run(&cli, project_dir, *finished, *from_artifact, *job_started_at).await?;
        }
        Commands::Status => cmd::cmd_status(&cli, &project_dir)?,
        Commands::Reset { force } => cmd::cmd_reset(&cli, &project_dir, *force)?,
        Commands::Budget { job_started_at } => {
            cmd::cmd_budget(&cli, &project_dir, *job_started_at)?
        }
        Commands::Config { command } => cmd::cmd_config(&cli, &project_dir, command.clone())?,
    }

    Ok(())
}
