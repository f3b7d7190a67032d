//! Configuration view and validation commands: `conductor config`.

use anyhow::Result;
use conductor::config::{CONFIG_FILE_NAME, ConductorToml};
use conductor::worker::DEFAULT_SHELL;
use std::path::Path;

use super::super::ConfigCommands;

fn print_config(toml: &ConductorToml) {
    let routing = &toml.routing;
    println!("[routing]");
    println!("  strategy = \"{}\"", routing.strategy);
    println!(
        "  oversubscription_factor = {}",
        routing.oversubscription_factor
    );
    println!(
        "  phase_fatal_on_no_eligible_worker = {}",
        routing.phase_fatal_on_no_eligible_worker
    );
    println!(
        "  deferred_task_timeout_secs = {}",
        routing.deferred_task_timeout_secs
    );
    println!("  score_decay = {}", routing.score_decay);
    if let Some(seed) = routing.seed {
        println!("  seed = {}", seed);
    }
    println!();

    let retry = &toml.retry;
    println!("[retry]");
    println!("  max_attempts = {}", retry.max_attempts);
    println!("  backoff_base_secs = {}", retry.backoff_base_secs);
    println!("  backoff_multiplier = {}", retry.backoff_multiplier);
    println!("  jitter_secs = {}", retry.jitter_secs);
    if let Some(max) = retry.max_backoff_secs {
        println!("  max_backoff_secs = {}", max);
    }
    println!("  critical_extra_attempt = {}", retry.critical_extra_attempt);
    for (class, overrides) in &retry.classes {
        let policy = retry.class_policy(overrides);
        println!(
            "  class \"{}\": max_attempts = {}, backoff_base = {:?}, multiplier = {}",
            class, policy.max_attempts, policy.backoff_base, policy.backoff_multiplier
        );
    }
    println!();

    println!("[execution]");
    match toml.execution.task_timeout_secs {
        Some(timeout) => println!("  task_timeout_secs = {}", timeout),
        None => println!("  task_timeout_secs = (none)"),
    }
    println!("  tick_interval_ms = {}", toml.execution.tick_interval_ms);
    println!(
        "  shell = \"{}\"",
        toml.execution.shell.as_deref().unwrap_or(DEFAULT_SHELL)
    );
    println!();

    if let Some(dir) = &toml.reporting.report_dir {
        println!("[reporting]");
        println!("  report_dir = \"{}\"", dir.display());
        println!();
    }

    if toml.workers.is_empty() {
        println!("No workers configured.");
    } else {
        println!("Workers:");
        for worker in &toml.workers {
            let capabilities: Vec<&str> = worker.capabilities.iter().map(String::as_str).collect();
            println!(
                "  {} weight={} capabilities=[{}]",
                worker.id,
                worker.weight,
                capabilities.join(", ")
            );
        }
    }
    println!();
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            let mut toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ConductorToml::load(&config_path)?
            } else {
                println!("No {} found at {}", CONFIG_FILE_NAME, project_dir.display());
                println!("Using default configuration.");
                ConductorToml::default()
            };
            println!();

            toml.apply_env_overrides()?;
            print_config(&toml);

            if !config_path.exists() {
                println!("Run 'conductor config init' to create a {} file.", CONFIG_FILE_NAME);
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE_NAME);
                return Ok(());
            }

            let toml = ConductorToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!(
                    "{} already exists at {}",
                    CONFIG_FILE_NAME,
                    config_path.display()
                );
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !project_dir.exists() {
                std::fs::create_dir_all(project_dir)?;
            }
            std::fs::write(&config_path, ConductorToml::default_toml())?;

            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [routing] strategy, oversubscription_factor, deferral timeout");
            println!("  - [retry] attempts and backoff, plus [retry.classes.<name>] overrides");
            println!("  - [[workers]] id, capabilities, weight");
            println!();
        }
    }

    Ok(())
}
