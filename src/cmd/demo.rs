//! `conductor demo`: run the built-in weather alert pipeline.

use anyhow::{Context, Result, bail};
use conductor::demo::{
    CHANNEL_NAMES, DemoOptions, default_config, default_input, demo_channels, demo_stages,
};
use conductor::engine::EngineBuilder;
use conductor::ui::{RunUI, UiMode};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{load_effective, locate_config};

pub struct DemoArgs<'a> {
    pub config: Option<&'a Path>,
    pub input: Option<&'a str>,
    pub fail_channel: Option<&'a str>,
    pub forecast_failures: u32,
    pub latency_ms: u64,
    pub ui: &'a str,
    pub verbose: bool,
}

pub async fn cmd_demo(project_dir: &Path, args: DemoArgs<'_>) -> Result<()> {
    let config = match locate_config(project_dir, args.config) {
        Some(path) => load_effective(&path)?,
        None => {
            let mut config = default_config()?;
            config.apply_env_overrides()?;
            config
        }
    };

    let problems = config.validate();
    if !problems.is_empty() {
        bail!(
            "Configuration is invalid:\n  - {}",
            problems.join("\n  - ")
        );
    }

    let input: Value = match args.input {
        Some(raw) => serde_json::from_str(raw).context("--input is not valid JSON")?,
        None => default_input(),
    };

    if let Some(name) = args.fail_channel
        && !CHANNEL_NAMES.contains(&name)
    {
        bail!(
            "Unknown channel '{}' (expected one of: {})",
            name,
            CHANNEL_NAMES.join(", ")
        );
    }

    let options = DemoOptions {
        forecast_failures: args.forecast_failures,
        fail_channel: args.fail_channel.map(str::to_string),
        latency: Duration::from_millis(args.latency_ms),
    };

    let ui = Arc::new(RunUI::new(UiMode::parse(args.ui), args.verbose));
    let engine = config
        .apply_to(
            EngineBuilder::new().progress_sink(ui.clone()),
            demo_stages(&options),
            demo_channels(&options),
        )?
        .build()?;

    ui.print_header(
        engine.entry_stage(),
        &engine.stage_names(),
        &engine.channel_names(),
    );

    let result = engine.run(&input).await?;
    ui.print_summary(&result);

    if !result.is_success() {
        let reason = result
            .state
            .failure()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        bail!("Run {} failed: {}", result.state.run_id(), reason);
    }
    Ok(())
}
