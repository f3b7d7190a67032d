use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::logging::{LogFormat, init_logging};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Phased task distribution across capability-tagged workers")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format on stderr
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Also write JSON logs to a daily-rolling file in this directory
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
    /// Execute a plan file phase by phase
    Run {
        /// Plan file (.json, .yaml or .yml)
        plan: PathBuf,

        /// Config file to use instead of <project-dir>/conductor.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the routing strategy
        #[arg(long)]
        strategy: Option<String>,

        /// Override the default retry attempt limit
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Simulate execution without running task commands
        #[arg(long)]
        dry_run: bool,

        /// Print the run report as JSON on stdout and events as JSON lines on stderr
        #[arg(long)]
        json: bool,
    },
    /// Validate a plan file and print its phases
    Plan {
        /// Plan file (.json, .yaml or .yml)
        plan: PathBuf,

        /// Print phases as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_format, cli.log_dir.as_deref())?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            plan,
            config,
            strategy,
            max_attempts,
            dry_run,
            json,
        } => {
            let options = cmd::RunOptions {
                plan: plan.clone(),
                config: config.clone(),
                strategy: strategy.clone(),
                max_attempts: *max_attempts,
                dry_run: *dry_run,
                json: *json,
            };
            if !cmd::cmd_run(&project_dir, options).await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Plan { plan, json } => cmd::cmd_plan(plan, *json)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(ExitCode::SUCCESS)
}
