//! Locating and loading the configuration file.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::controller::Herald;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "HERALD_CONFIG";

/// Searched, in order, when neither the flag nor the environment names a file.
pub const DEFAULT_PATHS: [&str; 2] = ["./herald.config.ron", "/etc/herald/herald.config.ron"];

/// Find the configuration file using the following precedence:
/// 1. The path given on the command line
/// 2. `HERALD_CONFIG` environment variable
/// 3. ./herald.config.ron (current working directory)
/// 4. /etc/herald/herald.config.ron (system-wide config)
///
/// # Errors
///
/// Fails if an explicitly named file does not exist, or if no candidate does.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let defaults = DEFAULT_PATHS.map(PathBuf::from);
    locate(explicit, std::env::var(CONFIG_ENV).ok(), &defaults)
}

fn locate(
    explicit: Option<&Path>,
    env: Option<String>,
    defaults: &[PathBuf],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Some(env_path) = env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config flag\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

/// Read and parse a configuration file.
///
/// # Errors
///
/// Fails if the file cannot be read or is not valid RON for [`Herald`].
pub fn load(path: &Path) -> anyhow::Result<Herald> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    ron::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
}
