//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module     | Commands handled        |
//! |------------|-------------------------|
//! | `validate` | `Validate`              |
//! | `demo`     | `Demo`                  |
//! | `config`   | `Config` (`init`, `show`) |

pub mod config;
pub mod demo;
pub mod validate;

pub use config::cmd_config;
pub use demo::cmd_demo;
pub use validate::cmd_validate;

use anyhow::Result;
use conductor::config::{CONFIG_FILE_NAME, EngineConfig};
use std::path::{Path, PathBuf};

/// Resolve the config to use: an explicit path, `conductor.toml` in the
/// project directory, or `None` when neither exists.
pub fn locate_config(project_dir: &Path, explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let candidate = project_dir.join(CONFIG_FILE_NAME);
            candidate.exists().then_some(candidate)
        }
    }
}

/// Load a config file and layer `CONDUCTOR_*` environment overrides on top.
pub fn load_effective(path: &Path) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(path)?;
    config.apply_env_overrides()?;
    Ok(config)
}
