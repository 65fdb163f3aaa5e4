//! Run progress UI.
//!
//! Renders the engine's progress stream in one of three modes:
//! - `full`: one spinner per stage with colors and a closing summary
//! - `minimal`: one line per finished attempt
//! - `json`: every event as a JSON line on stdout, for machine consumption

use crate::engine::{RunResult, RunStatus};
use crate::progress::{ProgressEvent, ProgressKind, ProgressSink};
use crate::ui::icons::{CHECK, CLOCK, CROSS, RETRY, RUNNING, SEND, SPARKLE};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Rich terminal UI with spinners
    #[default]
    Full,
    /// Single-line status updates
    Minimal,
    /// JSON-formatted events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    /// Parse UI mode from string (convenience method).
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Terminal sink for the engine's progress events.
pub struct RunUI {
    mode: UiMode,
    multi: MultiProgress,
    stage_bars: Mutex<HashMap<String, ProgressBar>>,
    verbose: bool,
    term: Term,
}

impl RunUI {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        Self {
            mode,
            multi: MultiProgress::new(),
            stage_bars: Mutex::new(HashMap::new()),
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("  {spinner} {prefix:.bold} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    fn done_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("  {prefix:.bold} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    fn println(&self, line: impl AsRef<str>) {
        if self.multi.println(line.as_ref()).is_err() {
            eprintln!("{}", line.as_ref());
        }
    }

    /// Header printed before the run starts (full mode only).
    pub fn print_header(&self, entry: &str, stages: &[&str], channels: &[&str]) {
        if self.mode != UiMode::Full {
            return;
        }
        self.println(format!("\n{} Pipeline", style("═".repeat(50)).cyan()));
        self.println(format!(
            "  entry: {}  stages: {}",
            style(entry).yellow().bold(),
            style(stages.join(", ")).dim()
        ));
        if !channels.is_empty() {
            self.println(format!(
                "  channels: {}",
                style(channels.join(", ")).dim()
            ));
        }
        self.println("");
    }

    fn handle_json(&self, event: &ProgressEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &ProgressEvent) {
        let line = match event.event {
            ProgressKind::Started => return,
            ProgressKind::Succeeded => format!("✓ {} (attempt {})", event.stage, event.attempt),
            ProgressKind::Retrying => format!(
                "↻ {} attempt {} failed, retrying: {}",
                event.stage,
                event.attempt,
                event.detail.as_deref().unwrap_or("")
            ),
            ProgressKind::Failed => format!(
                "✗ {} ({})",
                event.stage,
                event.detail.as_deref().unwrap_or("failed")
            ),
        };
        let _ = writeln!(&self.term, "{}", line);
    }

    fn handle_full(&self, event: &ProgressEvent) {
        let mut bars = self.stage_bars.lock().unwrap_or_else(|e| e.into_inner());
        match event.event {
            ProgressKind::Started => {
                let bar = bars.entry(event.stage.clone()).or_insert_with(|| {
                    let bar = self.multi.add(ProgressBar::new_spinner());
                    bar.set_style(Self::spinner_style());
                    bar.set_prefix(event.stage.clone());
                    bar.enable_steady_tick(Duration::from_millis(100));
                    bar
                });
                bar.set_message(format!(
                    "{}attempt {}",
                    RUNNING,
                    style(event.attempt).cyan()
                ));
            }
            ProgressKind::Retrying => {
                if let Some(bar) = bars.get(&event.stage) {
                    bar.set_message(format!(
                        "{}attempt {} failed, retrying",
                        RETRY,
                        style(event.attempt).yellow()
                    ));
                }
                if self.verbose {
                    self.println(format!(
                        "    {} {} attempt {}: {}",
                        style("→").dim(),
                        event.stage,
                        event.attempt,
                        style(event.detail.as_deref().unwrap_or("")).dim()
                    ));
                }
            }
            ProgressKind::Succeeded => {
                if let Some(bar) = bars.remove(&event.stage) {
                    bar.set_style(Self::done_style());
                    let attempts = if event.attempt > 1 {
                        format!(" after {} attempts", event.attempt)
                    } else {
                        String::new()
                    };
                    bar.finish_with_message(format!(
                        "{}{}",
                        CHECK,
                        style(format!("done{}", attempts)).green()
                    ));
                }
            }
            ProgressKind::Failed => {
                if let Some(bar) = bars.remove(&event.stage) {
                    bar.set_style(Self::done_style());
                    bar.finish_with_message(format!(
                        "{}{}",
                        CROSS,
                        style(event.detail.as_deref().unwrap_or("failed")).red()
                    ));
                }
            }
        }
    }

    /// Print the closing summary for a finished run.
    pub fn print_summary(&self, result: &RunResult) {
        let summary = result.summary();
        match self.mode {
            UiMode::Json => {
                if let Ok(json) = serde_json::to_string(&summary) {
                    let _ = writeln!(&self.term, "{}", json);
                }
                return;
            }
            UiMode::Minimal => {
                let _ = writeln!(
                    &self.term,
                    "Done: {} in {} ({} attempts)",
                    summary.status,
                    format_duration(summary.duration),
                    summary.total_attempts()
                );
                if let Some(ref report) = summary.delivery {
                    for r in &report.results {
                        let mark = if r.success { "✓" } else { "✗" };
                        let _ = writeln!(&self.term, "{} {}: {}", mark, r.channel, r.detail);
                    }
                }
                return;
            }
            UiMode::Full => {}
        }

        self.println("");
        if summary.status == RunStatus::Succeeded {
            self.println(format!(
                "{} Run {} {}",
                SPARKLE,
                style(summary.run_id).dim(),
                style("succeeded").green().bold()
            ));
        } else {
            self.println(format!(
                "{} Run {} {}",
                CROSS,
                style(summary.run_id).dim(),
                style("failed").red().bold()
            ));
            if let Some(ref failure) = summary.failure {
                self.println(format!("     {}", style(failure).red()));
            }
        }
        self.println(format!(
            "     {}Duration: {}",
            CLOCK,
            style(format_duration(summary.duration)).cyan()
        ));

        if self.verbose {
            self.println(format!("{}", style("Stage breakdown:").underlined()));
            for stage in &summary.stages {
                let mark = if stage.succeeded {
                    style("✓").green()
                } else {
                    style("✗").red()
                };
                self.println(format!(
                    "  {} {} - {} attempt(s), {}",
                    mark,
                    stage.stage,
                    stage.attempts,
                    format_duration(stage.duration)
                ));
            }
            for error in result.state.errors() {
                self.println(format!(
                    "  {} {}#{}: {}",
                    style("!").yellow(),
                    error.stage,
                    error.attempt,
                    style(&error.message).dim()
                ));
            }
        }

        if let Some(ref report) = summary.delivery {
            self.println(format!(
                "{}Delivery: {}/{} channels",
                SEND,
                style(report.success_count()).green().bold(),
                report.results.len()
            ));
            for r in &report.results {
                let mark = if r.success { CHECK } else { CROSS };
                self.println(format!(
                    "     {}{}: {}",
                    mark,
                    style(&r.channel).bold(),
                    style(&r.detail).dim()
                ));
            }
        }
        self.println("");
    }
}

impl ProgressSink for RunUI {
    fn on_event(&self, event: &ProgressEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }
}

/// Format a duration for display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!(UiMode::parse("json"), UiMode::Json);
        assert_eq!(UiMode::parse("JSON"), UiMode::Json);
        assert_eq!(UiMode::parse("minimal"), UiMode::Minimal);
        assert_eq!(UiMode::parse("full"), UiMode::Full);
        assert_eq!(UiMode::parse("anything_else"), UiMode::Full);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0ms");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_full_mode_tracks_bars_per_stage() {
        let ui = RunUI::new(UiMode::Full, false);
        let run_id = Uuid::nil();
        ui.on_event(&ProgressEvent::new(run_id, "a", 1, ProgressKind::Started));
        ui.on_event(&ProgressEvent::new(run_id, "b", 1, ProgressKind::Started));
        assert_eq!(ui.stage_bars.lock().unwrap().len(), 2);

        ui.on_event(&ProgressEvent::new(run_id, "a", 1, ProgressKind::Succeeded));
        ui.on_event(&ProgressEvent::new(run_id, "b", 1, ProgressKind::Failed).with_detail("boom"));
        assert!(ui.stage_bars.lock().unwrap().is_empty());
    }

    #[test]
    fn test_run_ui_creation() {
        let ui = RunUI::new(UiMode::Minimal, true);
        assert_eq!(ui.mode(), UiMode::Minimal);
        assert!(ui.verbose);
    }
}
