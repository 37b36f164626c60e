//! Proposals and their append-only store.
//!
//! A proposal never changes after creation. Its lifecycle is derived from
//! the journal: a `created` record followed by at most one `terminal`
//! record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use warden_common::{Journal, Result, SharedClock};

use crate::error::{Denial, GovResult, GovernanceError};
use crate::policy;
use crate::registry::{CapabilityRegistry, OperationKind};

/// Declared boundary a human approves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Directories the steps may write beneath.
    Paths(Vec<PathBuf>),
    /// Exact command lines the steps may run.
    Commands(Vec<String>),
}

impl Scope {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Paths(_) => OperationKind::Path,
            Self::Commands(_) => OperationKind::Command,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Paths(p) => p.is_empty(),
            Self::Commands(c) => c.is_empty(),
        }
    }
}

/// Concrete parameters that will actually run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ExecutionStep {
    WriteFile {
        path: PathBuf,
        content: String,
    },
    RunCommand {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        cwd: PathBuf,
    },
}

impl ExecutionStep {
    pub fn write_file(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self::WriteFile {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn run_command(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self::RunCommand {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::WriteFile { .. } => OperationKind::Path,
            Self::RunCommand { .. } => OperationKind::Command,
        }
    }

    /// Short description without file content.
    pub fn describe(&self) -> String {
        match self {
            Self::WriteFile { path, content } => {
                format!("write {} bytes to {}", content.len(), path.display())
            }
            Self::RunCommand { program, args, cwd } => format!(
                "run `{}` in {}",
                warden_tools::security::canonical_command(program, args),
                cwd.display()
            ),
        }
    }
}

/// A requested, immutable instance of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub capability: String,
    pub scope: Scope,
    pub steps: Vec<ExecutionStep>,
    pub created_at: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// How a proposal finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Executed,
    Denied,
    Revoked,
}

impl TerminalOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Denied => "denied",
            Self::Revoked => "revoked",
        }
    }
}

/// Stored lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Terminal(TerminalOutcome),
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum ProposalRecord {
    Created {
        proposal: Proposal,
    },
    Terminal {
        proposal_id: String,
        outcome: TerminalOutcome,
        at: DateTime<Utc>,
    },
}

fn find<'a>(rows: &'a [ProposalRecord], id: &str) -> Option<&'a Proposal> {
    rows.iter().find_map(|row| match row {
        ProposalRecord::Created { proposal } if proposal.id == id => Some(proposal),
        _ => None,
    })
}

fn terminal_of(rows: &[ProposalRecord], id: &str) -> Option<TerminalOutcome> {
    rows.iter().find_map(|row| match row {
        ProposalRecord::Terminal {
            proposal_id,
            outcome,
            ..
        } if proposal_id == id => Some(*outcome),
        _ => None,
    })
}

fn status_of(rows: &[ProposalRecord], id: &str) -> GovResult<ProposalStatus> {
    if find(rows, id).is_none() {
        return Err(GovernanceError::denied(Denial::UnknownProposal, id));
    }
    Ok(terminal_of(rows, id).map_or(ProposalStatus::Pending, ProposalStatus::Terminal))
}

/// Append-only proposal persistence.
pub struct ProposalStore {
    journal: Journal<ProposalRecord>,
    registry: Arc<CapabilityRegistry>,
    clock: SharedClock,
}

impl ProposalStore {
    /// File-backed store at `path`.
    pub fn open(
        path: &Path,
        lock_timeout: Duration,
        registry: Arc<CapabilityRegistry>,
        clock: SharedClock,
    ) -> Result<Self> {
        Ok(Self {
            journal: Journal::open(path, lock_timeout)?,
            registry,
            clock,
        })
    }

    pub fn in_memory(registry: Arc<CapabilityRegistry>, clock: SharedClock) -> Self {
        Self {
            journal: Journal::in_memory(),
            registry,
            clock,
        }
    }

    /// Validate and persist a new proposal.
    ///
    /// Every step must be executable as declared; nothing is written
    /// otherwise.
    pub fn create(
        &self,
        capability: &str,
        scope: Scope,
        steps: Vec<ExecutionStep>,
        session_id: &str,
        summary: Option<String>,
    ) -> GovResult<Proposal> {
        let cap = self.registry.require_enabled(capability)?;
        if steps.is_empty() {
            return Err(GovernanceError::denied(
                Denial::MalformedCommand,
                "proposal has no steps",
            ));
        }
        policy::check_scope(cap, &scope)?;
        for step in &steps {
            policy::check_step(cap, &scope, step)?;
        }

        let proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            capability: cap.name.clone(),
            scope,
            steps,
            created_at: self.clock.now(),
            session_id: session_id.to_string(),
            summary,
        };
        let record = ProposalRecord::Created {
            proposal: proposal.clone(),
        };
        self.journal
            .transact(|_| Ok::<_, GovernanceError>(((), vec![record])))?;

        tracing::info!(
            proposal_id = %proposal.id,
            capability = %proposal.capability,
            steps = proposal.steps.len(),
            "Proposal created"
        );
        Ok(proposal)
    }

    pub fn get(&self, id: &str) -> GovResult<Proposal> {
        let rows = self.journal.snapshot()?;
        find(&rows, id)
            .cloned()
            .ok_or_else(|| GovernanceError::denied(Denial::UnknownProposal, id))
    }

    pub fn status(&self, id: &str) -> GovResult<ProposalStatus> {
        let rows = self.journal.snapshot()?;
        status_of(&rows, id)
    }

    /// Proposal and status from one snapshot.
    pub fn get_with_status(&self, id: &str) -> GovResult<(Proposal, ProposalStatus)> {
        let rows = self.journal.snapshot()?;
        let proposal = find(&rows, id)
            .cloned()
            .ok_or_else(|| GovernanceError::denied(Denial::UnknownProposal, id))?;
        let status = status_of(&rows, id)?;
        Ok((proposal, status))
    }

    /// Non-terminal proposals, oldest first.
    pub fn list_pending(&self) -> Result<Vec<Proposal>> {
        let rows = self.journal.snapshot()?;
        Ok(rows
            .iter()
            .filter_map(|row| match row {
                ProposalRecord::Created { proposal }
                    if terminal_of(&rows, &proposal.id).is_none() =>
                {
                    Some(proposal.clone())
                }
                _ => None,
            })
            .collect())
    }

    /// Run `f` under the proposal journal lock while `id` is still pending.
    ///
    /// When `f` succeeds and `finish` is set, the proposal moves to that
    /// outcome in the same transaction. `f` must not call back into this
    /// store. Token operations nest inside this lock, never the reverse.
    pub fn with_pending<T>(
        &self,
        id: &str,
        finish: Option<TerminalOutcome>,
        f: impl FnOnce() -> GovResult<T>,
    ) -> GovResult<T> {
        let now = self.clock.now();
        let out = self.journal.transact(|rows| {
            if let ProposalStatus::Terminal(current) = status_of(rows, id)? {
                return Err(GovernanceError::denied(
                    Denial::ProposalTerminal,
                    format!("{id} is already {}", current.as_str()),
                ));
            }
            let out = f()?;
            let appended = finish
                .map(|outcome| ProposalRecord::Terminal {
                    proposal_id: id.to_string(),
                    outcome,
                    at: now,
                })
                .into_iter()
                .collect();
            Ok((out, appended))
        })?;
        if let Some(outcome) = finish {
            tracing::info!(proposal_id = %id, outcome = outcome.as_str(), "Proposal finished");
        }
        Ok(out)
    }

    /// Move a proposal to a terminal state.
    ///
    /// Repeating the same outcome is a no-op; a different outcome on a
    /// finished proposal is `ProposalTerminal`.
    pub fn mark_terminal(&self, id: &str, outcome: TerminalOutcome) -> GovResult<()> {
        let now = self.clock.now();
        let appended = self.journal.transact(|rows| {
            match status_of(rows, id)? {
                ProposalStatus::Terminal(current) if current == outcome => Ok((false, Vec::new())),
                ProposalStatus::Terminal(current) => Err(GovernanceError::denied(
                    Denial::ProposalTerminal,
                    format!("{id} is already {}", current.as_str()),
                )),
                ProposalStatus::Pending => Ok((
                    true,
                    vec![ProposalRecord::Terminal {
                        proposal_id: id.to_string(),
                        outcome,
                        at: now,
                    }],
                )),
            }
        })?;
        if appended {
            tracing::info!(proposal_id = %id, outcome = outcome.as_str(), "Proposal finished");
        }
        Ok(())
    }
}
