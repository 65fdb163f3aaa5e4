//! `conductor config`: view and scaffold configuration.

use anyhow::{Context, Result};
use conductor::config::{CONFIG_FILE_NAME, EngineConfig};
use conductor::demo::DEFAULT_CONFIG_TOML;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            let config = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                super::load_effective(&config_path)?
            } else {
                println!("No {} found at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Showing the built-in demo pipeline.");
                let mut config = EngineConfig::parse(DEFAULT_CONFIG_TOML)?;
                config.apply_env_overrides()?;
                config
            };
            println!();
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", config.to_toml()?);
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("{} already exists at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }

            std::fs::create_dir_all(project_dir)
                .with_context(|| format!("Failed to create {}", project_dir.display()))?;
            std::fs::write(&config_path, DEFAULT_CONFIG_TOML)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;

            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] entry_stage, max_steps, run_deadline_ms");
            println!("  - [stages.\"pattern-*\"] timeouts, idempotency and retry policies");
            println!("  - [[routes]] conditional and default transitions");
            println!("  - [delivery] channels, timeout_ms, max_concurrency");
            println!();
        }
    }

    Ok(())
}
