//! Configuration management for Warden.
//!
//! Warden reads a single JSON file at `~/.warden/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (`WARDEN_*` prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `WARDEN_DATA_DIR` → data_dir
//! - `WARDEN_REGISTRY` → registry_path
//! - `WARDEN_TOKEN_TTL_SECS` → token_ttl_secs
//! - `WARDEN_COMMAND_TIMEOUT_SECS` → command_timeout_secs
//! - `WARDEN_LOG_LEVEL` → observability.log_level

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".warden"),
        |dirs| dirs.home_dir().join(".warden"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}

fn default_token_ttl_secs() -> u64 {
    300
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_max_write_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_output_bytes() -> usize {
    8 * 1024
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Top-level Warden configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Directory holding the proposal, token and audit journals.
    /// Defaults to `<config_dir>/data`.
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Capability registry resource. Defaults to `<config_dir>/capabilities.json`.
    #[serde(default)]
    pub registry_path: Option<String>,

    /// Lifetime of an approval token.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Upper bound on one governed command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Largest content a scoped write accepts.
    #[serde(default = "default_max_write_bytes")]
    pub max_write_bytes: usize,

    /// Captured stdout/stderr are truncated to this many bytes each.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// How long to wait for a store's advisory file lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            registry_path: None,
            token_ttl_secs: default_token_ttl_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            max_write_bytes: default_max_write_bytes(),
            max_output_bytes: default_max_output_bytes(),
            lock_timeout_ms: default_lock_timeout_ms(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config from {}: {e}", path.display()))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config from {}: {e}", path.display()))
        })
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("WARDEN_DATA_DIR") {
            self.data_dir = Some(dir);
        }
        if let Ok(path) = std::env::var("WARDEN_REGISTRY") {
            self.registry_path = Some(path);
        }
        if let Ok(ttl) = std::env::var("WARDEN_TOKEN_TTL_SECS") {
            if let Ok(v) = ttl.parse() {
                self.token_ttl_secs = v;
            }
        }
        if let Ok(timeout) = std::env::var("WARDEN_COMMAND_TIMEOUT_SECS") {
            if let Ok(v) = timeout.parse() {
                self.command_timeout_secs = v;
            }
        }
        if let Ok(level) = std::env::var("WARDEN_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| config_dir().join("data"))
    }

    /// Resolved capability registry path.
    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| config_dir().join("capabilities.json"))
    }

    /// Token lifetime, capped at one year.
    pub fn token_ttl(&self) -> chrono::Duration {
        const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;
        chrono::Duration::seconds(self.token_ttl_secs.min(MAX_TTL_SECS) as i64)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_applied_for_missing_fields() {
        let config: WardenConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.token_ttl_secs, 300);
        assert_eq!(config.command_timeout_secs, 30);
        assert_eq!(config.max_write_bytes, 10 * 1024 * 1024);
        assert_eq!(config.lock_timeout_ms, 5_000);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"data_dir": "/srv/warden", "token_ttl_secs": 60, "observability": {"level": "debug"}}"#,
        )
        .unwrap();

        let config = WardenConfig::load_from(&path).unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/srv/warden"));
        assert_eq!(config.token_ttl(), chrono::Duration::seconds(60));
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn malformed_file_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = WardenConfig::load_from(&path).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn absolute_paths_pass_through_expansion() {
        assert_eq!(expand_path("/srv/warden"), PathBuf::from("/srv/warden"));
    }
}
