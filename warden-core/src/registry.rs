//! Static capability registry.
//!
//! Loaded once from a JSON resource of the shape
//!
//! ```json
//! {"capabilities": {"name": {"tier": "approval_required", "kind": "path",
//!   "allow_patterns": [], "deny_patterns": [],
//!   "allowed_roots": ["~/reports"], "protected_paths": ["~/.ssh"]}}}
//! ```
//!
//! Patterns are compiled and roots resolved at load time; there is no
//! mutation API afterwards.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use warden_common::config::expand_path;
use warden_common::{Error, Result};
use warden_tools::security::resolve_path;

use crate::error::{Denial, GovResult, GovernanceError};

/// Risk tier of a capability.
///
/// `open` is informational: every governed action still goes through
/// proposal and approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Open,
    ApprovalRequired,
    Disabled,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ApprovalRequired => "approval_required",
            Self::Disabled => "disabled",
        }
    }
}

/// The closed set of operation kinds a capability governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Runs a program (`run_command` steps).
    Command,
    /// Writes under a directory (`write_file` steps).
    Path,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Path => "path",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    capabilities: BTreeMap<String, CapabilityDef>,
}

#[derive(Debug, Deserialize)]
struct CapabilityDef {
    #[serde(alias = "risk_tier")]
    tier: RiskTier,
    #[serde(default)]
    kind: Option<OperationKind>,
    #[serde(default)]
    allow_patterns: Vec<String>,
    #[serde(default)]
    deny_patterns: Vec<String>,
    #[serde(default)]
    allowed_roots: Vec<String>,
    #[serde(default)]
    protected_paths: Vec<String>,
}

/// A registered capability with compiled patterns and resolved paths.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: String,
    pub tier: RiskTier,
    pub kind: OperationKind,
    pub allow_patterns: Vec<Regex>,
    pub deny_patterns: Vec<Regex>,
    pub allowed_roots: Vec<PathBuf>,
    pub protected_paths: Vec<PathBuf>,
}

impl Capability {
    pub fn is_enabled(&self) -> bool {
        self.tier != RiskTier::Disabled
    }

    fn from_def(name: &str, def: CapabilityDef, base: &Path) -> Result<Self> {
        let kind = def.kind.unwrap_or(
            if def.allow_patterns.is_empty() && def.deny_patterns.is_empty() {
                OperationKind::Path
            } else {
                OperationKind::Command
            },
        );
        Ok(Self {
            name: name.to_string(),
            tier: def.tier,
            kind,
            allow_patterns: compile_patterns(name, &def.allow_patterns)?,
            deny_patterns: compile_patterns(name, &def.deny_patterns)?,
            allowed_roots: resolve_all(&def.allowed_roots, base),
            protected_paths: resolve_all(&def.protected_paths, base),
        })
    }
}

fn compile_patterns(capability: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    Error::Config(format!(
                        "Invalid pattern {p:?} for capability {capability}: {e}"
                    ))
                })
        })
        .collect()
}

fn resolve_all(raw: &[String], base: &Path) -> Vec<PathBuf> {
    raw.iter()
        .map(|r| resolve_path(&expand_path(r), base))
        .collect()
}

/// Immutable name → capability map.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Capability>,
}

impl CapabilityRegistry {
    /// Load from a JSON file. Relative roots resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read capability registry {}: {e}",
                path.display()
            ))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let registry = Self::from_json(&text, base)?;
        tracing::info!(
            path = %path.display(),
            capabilities = registry.capabilities.len(),
            "Capability registry loaded"
        );
        Ok(registry)
    }

    /// Parse a registry document. Relative roots resolve against `base`.
    pub fn from_json(text: &str, base: &Path) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("Invalid capability registry: {e}")))?;

        let mut capabilities = BTreeMap::new();
        for (name, def) in file.capabilities {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(Error::Config("Capability name must not be empty".into()));
            }
            if capabilities.contains_key(&name) {
                return Err(Error::Config(format!("Duplicate capability name {name:?}")));
            }
            let capability = Capability::from_def(&name, def, base)?;
            capabilities.insert(name, capability);
        }
        Ok(Self { capabilities })
    }

    /// Find a capability by name.
    pub fn lookup(&self, name: &str) -> GovResult<&Capability> {
        self.capabilities
            .get(name)
            .ok_or_else(|| GovernanceError::denied(Denial::UnknownCapability, name))
    }

    /// Like [`lookup`](Self::lookup), refusing disabled capabilities.
    pub fn require_enabled(&self, name: &str) -> GovResult<&Capability> {
        let capability = self.lookup(name)?;
        if !capability.is_enabled() {
            return Err(GovernanceError::denied(Denial::DisabledCapability, name));
        }
        Ok(capability)
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.values()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
