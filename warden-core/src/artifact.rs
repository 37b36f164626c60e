//! Turn artifacts and the sink that persists them.
//!
//! Every turn produces exactly one [`Artifact`]. Negative paths carry fixed
//! placeholders ([`NO_PROPOSAL`], [`INVALID_TOKEN_DIGEST`]) instead of
//! blank fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use warden_common::storage::append_jsonl;
use warden_common::{Error, Result};
use warden_tools::OperationOutcome;

use crate::proposal::{ExecutionStep, Scope};

pub use crate::audit::NO_PROPOSAL;

/// Token digest placeholder when no token could be identified.
pub const INVALID_TOKEN_DIGEST: &str = "invalid";

/// Reason code for infrastructure faults.
pub const INTERNAL_ERROR: &str = "internal_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
}

/// Result of one executed step, as reported in the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub description: String,
    pub outcome: OperationOutcome,
}

/// Output of one governance turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Artifact {
    ProposalAction {
        proposal_id: String,
        capability: String,
        scope: Scope,
        steps: Vec<ExecutionStep>,
        requires_approval: bool,
        no_autonomy: bool,
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        /// Diff or command line of what approval would allow.
        #[serde(default)]
        preview: String,
    },
    ApprovalToken {
        proposal_id: String,
        token_id: String,
        token_digest: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    ExecutedAction {
        proposal_id: String,
        token_digest: String,
        outcome: ExecutionOutcome,
        result_summary: String,
        executed_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        results: Vec<StepResult>,
    },
    DeniedAction {
        proposal_id: String,
        reason: String,
        message: String,
        denied_at: DateTime<Utc>,
    },
    RevokedToken {
        target_kind: String,
        target_id: String,
        revoked_at: DateTime<Utc>,
        revoked_count: usize,
    },
}

impl Artifact {
    /// The `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProposalAction { .. } => "proposal_action",
            Self::ApprovalToken { .. } => "approval_token",
            Self::ExecutedAction { .. } => "executed_action",
            Self::DeniedAction { .. } => "denied_action",
            Self::RevokedToken { .. } => "revoked_token",
        }
    }

    /// Proposal this artifact concerns, or the placeholder.
    pub fn proposal_id(&self) -> &str {
        match self {
            Self::ProposalAction { proposal_id, .. }
            | Self::ApprovalToken { proposal_id, .. }
            | Self::ExecutedAction { proposal_id, .. }
            | Self::DeniedAction { proposal_id, .. } => proposal_id,
            Self::RevokedToken { .. } => NO_PROPOSAL,
        }
    }

    pub fn is_denial(&self) -> bool {
        match self {
            Self::DeniedAction { .. } => true,
            Self::ExecutedAction { outcome, .. } => *outcome == ExecutionOutcome::Failure,
            _ => false,
        }
    }

    pub fn denied(
        proposal_id: Option<&str>,
        reason: impl Into<String>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::DeniedAction {
            proposal_id: non_empty(proposal_id, NO_PROPOSAL),
            reason: reason.into(),
            message: message.into(),
            denied_at: at,
        }
    }

    /// Failure variant of `executed_action`.
    pub fn execution_failed(
        proposal_id: Option<&str>,
        token_digest: Option<&str>,
        error: impl Into<String>,
        summary: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::ExecutedAction {
            proposal_id: non_empty(proposal_id, NO_PROPOSAL),
            token_digest: non_empty(token_digest, INVALID_TOKEN_DIGEST),
            outcome: ExecutionOutcome::Failure,
            result_summary: summary.into(),
            executed_at: at,
            error: Some(error.into()),
            results: Vec::new(),
        }
    }

    /// Operator-facing rendering.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        match self {
            Self::ProposalAction {
                proposal_id,
                capability,
                scope,
                steps,
                created_at,
                summary,
                preview,
                ..
            } => {
                let _ = writeln!(out, "## Proposal `{proposal_id}`");
                let _ = writeln!(out, "- capability: `{capability}`");
                if let Some(summary) = summary {
                    let _ = writeln!(out, "- summary: {summary}");
                }
                match scope {
                    Scope::Paths(paths) => {
                        for p in paths {
                            let _ = writeln!(out, "- scope path: `{}`", p.display());
                        }
                    }
                    Scope::Commands(commands) => {
                        for c in commands {
                            let _ = writeln!(out, "- scope command: `{c}`");
                        }
                    }
                }
                for (i, step) in steps.iter().enumerate() {
                    let _ = writeln!(out, "- step {}: {}", i + 1, step.describe());
                }
                let _ = writeln!(out, "- created: {}", created_at.to_rfc3339());
                if !preview.is_empty() {
                    let _ = writeln!(out, "\n### Preview\n```diff\n{}\n```", preview.trim_end());
                }
                let _ = writeln!(out, "\nApproval required: `approve {proposal_id}`");
            }
            Self::ApprovalToken {
                proposal_id,
                token_id,
                expires_at,
                ..
            } => {
                let _ = writeln!(out, "## Approved `{proposal_id}`");
                let _ = writeln!(out, "- token id: `{token_id}`");
                let _ = writeln!(out, "- expires: {}", expires_at.to_rfc3339());
            }
            Self::ExecutedAction {
                proposal_id,
                outcome,
                result_summary,
                error,
                results,
                ..
            } => {
                let status = match outcome {
                    ExecutionOutcome::Success => "succeeded",
                    ExecutionOutcome::Failure => "failed",
                };
                let _ = writeln!(out, "## Execution {status} `{proposal_id}`");
                let _ = writeln!(out, "- result: {result_summary}");
                if let Some(error) = error {
                    let _ = writeln!(out, "- error: `{error}`");
                }
                for r in results {
                    let _ = writeln!(out, "- step {}: {}", r.index + 1, r.outcome.summary());
                    if let OperationOutcome::Ran { stdout, stderr, .. } = &r.outcome {
                        if !stdout.trim().is_empty() {
                            let _ = writeln!(out, "\n```\n{}\n```", stdout.trim_end());
                        }
                        if !stderr.trim().is_empty() {
                            let _ = writeln!(out, "\nstderr:\n```\n{}\n```", stderr.trim_end());
                        }
                    }
                }
            }
            Self::DeniedAction {
                proposal_id,
                reason,
                message,
                ..
            } => {
                let _ = writeln!(out, "## Denied `{proposal_id}`");
                let _ = writeln!(out, "- reason: `{reason}`");
                let _ = writeln!(out, "- {message}");
            }
            Self::RevokedToken {
                target_kind,
                target_id,
                revoked_count,
                ..
            } => {
                let _ = writeln!(out, "## Revoked {target_kind} `{target_id}`");
                let _ = writeln!(out, "- tokens revoked: {revoked_count}");
            }
        }
        out
    }
}

fn non_empty(value: Option<&str>, placeholder: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => placeholder.to_string(),
    }
}

/// External persistence for turn artifacts.
pub trait ArtifactSink: Send + Sync {
    fn persist(&self, artifact: &Artifact) -> Result<()>;
}

/// Discards artifacts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ArtifactSink for NullSink {
    fn persist(&self, _artifact: &Artifact) -> Result<()> {
        Ok(())
    }
}

/// Keeps artifacts in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    artifacts: Mutex<Vec<Artifact>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ArtifactSink for RecordingSink {
    fn persist(&self, artifact: &Artifact) -> Result<()> {
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(artifact.clone());
        Ok(())
    }
}

/// Appends artifacts to a JSONL file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArtifactSink for JsonlSink {
    fn persist(&self, artifact: &Artifact) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        append_jsonl(&self.path, std::slice::from_ref(artifact))
    }
}
