//! Opening configuration, registry and stores for a CLI invocation.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use warden_common::clock::system_clock;
use warden_common::{Validate, WardenConfig};
use warden_core::protocol::AUDIT_DIR;
use warden_core::{AuditLog, CapabilityRegistry, GovernanceProtocol, JsonlSink};

/// Artifacts of every turn are appended here, under the data directory.
pub const ARTIFACTS_FILE: &str = "artifacts.jsonl";

/// Command-line flags that take precedence over the config file and
/// environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub registry: Option<PathBuf>,
}

/// Load and validate configuration.
pub fn load_config(overrides: &Overrides) -> Result<WardenConfig> {
    let mut config = WardenConfig::load_with_env(overrides.config.as_deref())?;
    if let Some(dir) = &overrides.data_dir {
        config.data_dir = Some(dir.display().to_string());
    }
    if let Some(path) = &overrides.registry {
        config.registry_path = Some(path.display().to_string());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn load_registry(config: &WardenConfig) -> Result<CapabilityRegistry> {
    let path = config.registry_path();
    CapabilityRegistry::load(&path)
        .with_context(|| format!("Failed to load capability registry {}", path.display()))
}

/// The protocol over file-backed stores, persisting artifacts as JSONL.
pub fn open_protocol(config: &WardenConfig) -> Result<GovernanceProtocol> {
    let registry = load_registry(config)?;
    let sink = JsonlSink::new(config.data_dir().join(ARTIFACTS_FILE))?;
    let protocol = GovernanceProtocol::open(config, registry, system_clock())
        .context("Failed to open governance stores")?
        .with_sink(Arc::new(sink));
    Ok(protocol)
}

/// The audit log alone, for read-only inspection.
pub fn open_audit(config: &WardenConfig) -> Result<AuditLog> {
    let dir = config.data_dir().join(AUDIT_DIR);
    Ok(AuditLog::open(&dir, config.lock_timeout(), system_clock())?)
}
