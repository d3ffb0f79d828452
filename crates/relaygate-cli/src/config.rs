//! Gateway configuration file at `~/.relaygate/config.toml`.
//!
//! The file mirrors the gateway's configuration tree (`[settings]`,
//! `[tcpServer]`, `[controlChannel]`, `[connectionChannel]`). It is read as
//! an untyped overlay so the gateway can report every rejected key instead of
//! failing on the first one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "~/.relaygate/config.toml";

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Load the overlay at `path`, or an empty one when the file does not exist.
pub fn load_overlay(path: &str) -> Result<serde_json::Value> {
    let path = expand_tilde(path);
    if !path.exists() {
        debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(serde_json::Value::Object(Default::default()));
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let overlay = parse_overlay(&content, &path)?;
    debug!(path = %path.display(), "loaded config");
    Ok(overlay)
}

fn parse_overlay(content: &str, path: &Path) -> Result<serde_json::Value> {
    let table: toml::Table = toml::from_str(content)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    serde_json::to_value(table)
        .with_context(|| format!("failed to convert config at {}", path.display()))
}
