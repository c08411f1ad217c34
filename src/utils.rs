//! Utility functions shared across the harness.
//!
//! File loading for TOML/YAML configuration and a few helpers for building
//! shell command lines that run on the guest.

use anyhow::{Context, Result};
use log::error;
use serde::de::DeserializeOwned;
use std::{fs, path::Path};

/// Conventional name of the sentinel file a guest script writes
pub const DEFAULT_SENTINEL: &str = "state.txt";

/// Conventional name of the parameter file uploaded next to a guest script
pub const CONSTANTS_FILE: &str = "constants.sh";

/// Reads a TOML file into an arbitrary struct.
///
/// # Parameters
///
/// - `path`: The path of the TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn read_toml_from_file<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: T = match toml::de::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to parse TOML file {}: {e}", path.display());
            return Err(e).with_context(|| format!("Invalid TOML in {}", path.display()));
        }
    };
    Ok(config)
}

/// Reads a YAML file into an arbitrary struct.
pub fn read_yaml_from_file<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML in {}", path.display()))
}

/// Reads a TOML or YAML file, picked by extension (`.yaml`/`.yml` are YAML).
pub fn read_config_file<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => read_yaml_from_file(path),
        _ => read_toml_from_file(path),
    }
}

/// Quotes a string for a POSIX shell by wrapping it in single quotes.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Joins a remote directory and a relative path with exactly one `/`.
///
/// Absolute `path` values are returned unchanged.
pub fn remote_join(dir: &str, path: &str) -> String {
    if path.starts_with('/') {
        return path.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), path)
}

/// Returns the last component of a `/`-separated path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
