//! Governed execution.
//!
//! The executor trusts nothing decided earlier: it reloads the proposal,
//! validates the token and re-runs the policy for every step before
//! anything happens. Only then is the token consumed and are the steps
//! performed, in order, stopping at the first failure.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use warden_common::{SharedClock, WardenConfig};
use warden_tools::{OperationOutcome, ScopedFileWriter, ScopedShell};

use crate::artifact::StepResult;
use crate::error::{Denial, GovResult, GovernanceError};
use crate::policy::{decide, DecisionContext, Decision, ResolvedStep};
use crate::proposal::{ExecutionStep, Proposal, ProposalStore, TerminalOutcome};
use crate::registry::CapabilityRegistry;
use crate::token::TokenStore;

/// What happened when a proposal ran.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub proposal_id: String,
    pub token_digest: String,
    pub results: Vec<StepResult>,
    pub planned_steps: usize,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionReport {
    /// Every step ran and succeeded.
    pub fn success(&self) -> bool {
        self.results.len() == self.planned_steps && self.results.iter().all(|r| r.outcome.is_success())
    }

    pub fn summary(&self) -> String {
        match self.results.iter().find(|r| !r.outcome.is_success()) {
            Some(failed) => format!(
                "step {} of {} {}",
                failed.index + 1,
                self.planned_steps,
                failed.outcome.summary()
            ),
            None => match self.results.as_slice() {
                [only] => only.outcome.summary(),
                _ => format!("{} steps succeeded", self.results.len()),
            },
        }
    }
}

/// Runs approved proposals.
pub struct ScopedExecutor {
    registry: Arc<CapabilityRegistry>,
    proposals: Arc<ProposalStore>,
    tokens: Arc<TokenStore>,
    writer: ScopedFileWriter,
    shell: ScopedShell,
    clock: SharedClock,
}

impl ScopedExecutor {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        proposals: Arc<ProposalStore>,
        tokens: Arc<TokenStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            proposals,
            tokens,
            writer: ScopedFileWriter::default(),
            shell: ScopedShell::default(),
            clock,
        }
    }

    /// Apply write and command limits from configuration.
    pub fn with_config(mut self, config: &WardenConfig) -> Self {
        self.writer = ScopedFileWriter::new(config.max_write_bytes);
        self.shell = ScopedShell::new()
            .with_timeout(config.command_timeout())
            .with_max_output_bytes(config.max_output_bytes);
        self
    }

    pub fn with_shell(mut self, shell: ScopedShell) -> Self {
        self.shell = shell;
        self
    }

    /// Run `steps` of `proposal` under `token_value`.
    ///
    /// Validation or policy failures leave the token and proposal untouched.
    /// Consuming the token finishes the proposal as executed, whatever the
    /// steps return.
    pub async fn run(
        &self,
        proposal: &Proposal,
        steps: &[ExecutionStep],
        token_value: &str,
    ) -> GovResult<ExecutionReport> {
        let (stored, status) = self.proposals.get_with_status(&proposal.id)?;
        if stored != *proposal {
            return Err(GovernanceError::denied(
                Denial::ScopeViolation,
                format!("{} does not match the stored proposal", proposal.id),
            ));
        }
        if steps.is_empty() {
            return Err(GovernanceError::denied(
                Denial::MalformedCommand,
                "nothing to execute",
            ));
        }

        let token = match self.tokens.validate(token_value) {
            Ok(token) => Some(token),
            Err(GovernanceError::Denied { .. }) => None,
            Err(e) => return Err(e),
        };
        let capability = self.registry.require_enabled(&stored.capability)?;
        let ctx = DecisionContext {
            capability,
            status,
            token: token.as_ref(),
            now: self.clock.now(),
        };

        let mut resolved = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            match decide(&ctx, &stored, step) {
                Decision::Allow(step) => resolved.push(step),
                Decision::Deny { denial, detail } => {
                    tracing::warn!(
                        proposal_id = %stored.id,
                        step = index,
                        reason = denial.code(),
                        detail = %detail,
                        "Execution denied"
                    );
                    return Err(GovernanceError::Denied { denial, detail });
                }
            }
        }
        for step in &resolved {
            if let ResolvedStep::WriteFile { content, .. } = step {
                self.writer
                    .check_size(content)
                    .map_err(|e| GovernanceError::denied(Denial::MalformedCommand, e))?;
            }
        }

        // A deny or revoke from another handle may have landed since the
        // policy check; the token is only spent while the proposal is open.
        let consumed = self.proposals.with_pending(
            &stored.id,
            Some(TerminalOutcome::Executed),
            || self.tokens.consume(token_value, &stored.id),
        )?;

        let mut results = Vec::with_capacity(resolved.len());
        for (index, (step, original)) in resolved.iter().zip(steps).enumerate() {
            let outcome = self.perform(step).await;
            tracing::info!(
                proposal_id = %stored.id,
                step = index,
                success = outcome.is_success(),
                result = %outcome.summary(),
                "Step performed"
            );
            let ok = outcome.is_success();
            results.push(StepResult {
                index,
                description: original.describe(),
                outcome,
            });
            if !ok {
                break;
            }
        }

        Ok(ExecutionReport {
            proposal_id: stored.id.clone(),
            token_digest: consumed.token_digest,
            results,
            planned_steps: steps.len(),
            executed_at: self.clock.now(),
        })
    }

    async fn perform(&self, step: &ResolvedStep) -> OperationOutcome {
        match step {
            ResolvedStep::WriteFile { path, content } => self.writer.write(path, content).await,
            ResolvedStep::RunCommand {
                program, args, cwd, ..
            } => self.shell.run(program, args, cwd).await,
        }
    }
}
