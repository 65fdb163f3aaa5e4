//! `conductor validate`: check a pipeline file and print its routing table.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;

use super::locate_config;

pub fn cmd_validate(project_dir: &Path, file: Option<&Path>) -> Result<()> {
    let Some(path) = locate_config(project_dir, file) else {
        bail!(
            "No conductor.toml found in {}. Pass a file or run 'conductor config init'.",
            project_dir.display()
        );
    };

    println!();
    println!("Validating {}...", path.display());
    println!();

    let config = super::load_effective(&path)?;
    let problems = config.validate();
    let router = config.to_router();

    println!(
        "Entry stage: {}",
        config.engine.entry_stage.as_deref().unwrap_or("(not set)")
    );
    println!("Max steps:   {}", config.engine.max_steps);
    if let Some(ms) = config.engine.run_deadline_ms {
        println!("Deadline:    {}ms", ms);
    }
    println!();

    if config.routes.is_empty() {
        println!("No routes: the entry stage is terminal.");
    } else {
        println!("Routes:");
        for route in &config.routes {
            let guard = if route.default {
                "default".to_string()
            } else {
                route
                    .when
                    .as_ref()
                    .map(|c| format!("when {}", c))
                    .unwrap_or_else(|| "always".to_string())
            };
            println!(
                "  {} -> {}  {}",
                style(&route.from).bold(),
                style(&route.to).bold(),
                style(format!("[{}]", guard)).dim()
            );
        }
    }

    let shadowed = router.shadowed_rules();
    if !shadowed.is_empty() {
        println!();
        println!("Unreachable rules:");
        for (from, to) in &shadowed {
            println!(
                "  {} {} -> {} follows an unconditional rule",
                style("!").yellow(),
                from,
                to
            );
        }
    }

    if !config.delivery.channels.is_empty() {
        println!();
        println!("Channels: {}", config.delivery.channels.join(", "));
    }
    println!();

    if problems.is_empty() {
        println!("{}", style("Configuration is valid.").green());
        println!();
        Ok(())
    } else {
        println!("Configuration problems:");
        for problem in &problems {
            println!("  - {}", problem);
        }
        println!();
        bail!("{} problem(s) found in {}", problems.len(), path.display())
    }
}
