//! Integration tests for the conductor CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a conductor Command with simulated latency turned down
fn conductor() -> Command {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.env_remove("RUST_LOG")
        .env_remove("CONDUCTOR_MAX_STEPS")
        .env_remove("CONDUCTOR_RUN_DEADLINE_MS")
        .env_remove("CONDUCTOR_DELIVERY_TIMEOUT_MS");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_config(dir: &TempDir) {
    conductor()
        .current_dir(dir.path())
        .args(["config", "init"])
        .assert()
        .success();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        conductor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("validate"))
            .stdout(predicate::str::contains("demo"));
    }

    #[test]
    fn test_version() {
        conductor().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        conductor().arg("explode").assert().failure();
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created conductor.toml"));

        let content = fs::read_to_string(dir.path().join("conductor.toml")).unwrap();
        assert!(content.contains("entry_stage = \"locate\""));
    }

    #[test]
    fn test_config_init_keeps_existing_file() {
        let dir = create_temp_project();
        fs::write(dir.path().join("conductor.toml"), "# mine\n").unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        assert_eq!(
            fs::read_to_string(dir.path().join("conductor.toml")).unwrap(),
            "# mine\n"
        );
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("built-in demo pipeline"))
            .stdout(predicate::str::contains("[engine]"));
    }

    #[test]
    fn test_config_show_applies_env_overrides() {
        let dir = create_temp_project();
        init_config(&dir);

        conductor()
            .current_dir(dir.path())
            .env("CONDUCTOR_MAX_STEPS", "5")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_steps = 5"));
    }

    #[test]
    fn test_config_show_rejects_bad_env_value() {
        let dir = create_temp_project();
        init_config(&dir);

        conductor()
            .current_dir(dir.path())
            .env("CONDUCTOR_MAX_STEPS", "lots")
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("CONDUCTOR_MAX_STEPS"));
    }
}

// =============================================================================
// Validate Command Tests
// =============================================================================

mod validate_command {
    use super::*;

    #[test]
    fn test_validate_generated_config() {
        let dir = create_temp_project();
        init_config(&dir);

        conductor()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("forecast -> compose_alert"))
            .stdout(predicate::str::contains("[default]"))
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_validate_without_config_fails() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No conductor.toml found"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let dir = create_temp_project();
        let path = dir.path().join("broken.toml");
        fs::write(
            &path,
            r#"
[engine]
max_steps = 0

[stages.fetch.retry]
max_attempts = 0
retry_on = ["sometimes"]
"#,
        )
        .unwrap();

        conductor()
            .arg("validate")
            .arg(&path)
            .assert()
            .failure()
            .stdout(predicate::str::contains("engine.entry_stage is not set"))
            .stdout(predicate::str::contains("engine.max_steps must be at least 1"))
            .stdout(predicate::str::contains("unknown error kind 'sometimes'"));
    }

    #[test]
    fn test_validate_flags_unreachable_rules() {
        let dir = create_temp_project();
        let path = dir.path().join("shadowed.toml");
        fs::write(
            &path,
            r#"
[engine]
entry_stage = "a"

[[routes]]
from = "a"
to = "b"

[[routes]]
from = "a"
to = "c"
when = { kind = "output_exists", stage = "a" }
"#,
        )
        .unwrap();

        conductor()
            .arg("validate")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Unreachable rules:"))
            .stdout(predicate::str::contains("a -> c"));
    }

    #[test]
    fn test_validate_rejects_malformed_toml() {
        let dir = create_temp_project();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[engine\nentry_stage = ").unwrap();

        conductor().arg("validate").arg(&path).assert().failure();
    }
}

// =============================================================================
// Demo Command Tests
// =============================================================================

mod demo_command {
    use super::*;

    #[test]
    fn test_demo_minimal_succeeds() {
        conductor()
            .args(["demo", "--ui", "minimal", "--latency-ms", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("compose_alert"))
            .stdout(predicate::str::contains("Done: succeeded"));
    }

    #[test]
    fn test_demo_json_emits_events_and_summary() {
        let output = conductor()
            .args(["demo", "--ui", "json", "--latency-ms", "1", "--forecast-failures", "0"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let stdout = String::from_utf8(output.stdout).unwrap();
        let lines: Vec<serde_json::Value> = stdout
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let summary = lines.last().unwrap();
        assert_eq!(summary["status"], "succeeded");
        assert_eq!(summary["terminal_stage"], "compose_alert");
        assert!(lines.iter().any(|l| l["event"] == "started" && l["stage"] == "locate"));
    }

    #[test]
    fn test_demo_mild_input_routes_to_digest() {
        conductor()
            .args([
                "demo",
                "--ui",
                "minimal",
                "--latency-ms",
                "1",
                "--input",
                r#"{"location": "Lisbon", "days": 2}"#,
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("compose_digest"));
    }

    #[test]
    fn test_demo_failing_channel_does_not_fail_run() {
        conductor()
            .args(["demo", "--ui", "minimal", "--latency-ms", "1", "--fail-channel", "sms"])
            .assert()
            .success()
            .stdout(predicate::str::contains("✗ sms"))
            .stdout(predicate::str::contains("✓ email"));
    }

    #[test]
    fn test_demo_unknown_location_fails() {
        conductor()
            .args([
                "demo",
                "--ui",
                "minimal",
                "--latency-ms",
                "1",
                "--input",
                r#"{"location": "Atlantis"}"#,
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown location 'Atlantis'"));
    }

    #[test]
    fn test_demo_rejects_invalid_input_json() {
        conductor()
            .args(["demo", "--input", "{not json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--input is not valid JSON"));
    }

    #[test]
    fn test_demo_rejects_unknown_fail_channel() {
        conductor()
            .args(["demo", "--fail-channel", "pager"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown channel 'pager'"));
    }

    #[test]
    fn test_demo_retries_exhausted() {
        conductor()
            .args([
                "demo",
                "--ui",
                "minimal",
                "--latency-ms",
                "1",
                "--forecast-failures",
                "10",
            ])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Done: failed"));
    }

    #[test]
    fn test_demo_uses_project_config() {
        let dir = create_temp_project();
        init_config(&dir);
        let path = dir.path().join("conductor.toml");
        let content = fs::read_to_string(&path)
            .unwrap()
            .replace("channels = [\"console\", \"email\", \"sms\"]", "channels = [\"console\"]");
        fs::write(&path, content).unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["demo", "--ui", "minimal", "--latency-ms", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("✓ console"))
            .stdout(predicate::str::contains("email").not());
    }

    #[test]
    fn test_log_dir_flag_writes_log_file() {
        let dir = create_temp_project();
        let logs = dir.path().join("logs");

        conductor()
            .args(["demo", "--ui", "minimal", "--latency-ms", "1", "--log-dir"])
            .arg(&logs)
            .assert()
            .success();

        let entries: Vec<_> = fs::read_dir(&logs).unwrap().collect();
        assert!(!entries.is_empty());
    }
}
