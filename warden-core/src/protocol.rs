//! The turn protocol.
//!
//! Every command line handed to [`GovernanceProtocol::handle`] yields
//! exactly one [`Artifact`], on success, on denial and on internal error
//! alike. Which commands are accepted in which proposal state is decided by
//! one transition table; everything else is a denial.

use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use warden_common::redact::redact_text;
use warden_common::{Error, Result, SharedClock, WardenConfig};

use crate::artifact::{
    Artifact, ArtifactSink, ExecutionOutcome, NullSink, INTERNAL_ERROR, NO_PROPOSAL,
};
use crate::audit::{AuditEventType, AuditLog, NewEvent};
use crate::command::{self, TurnCommand, Verb};
use crate::error::{Denial, GovResult, GovernanceError};
use crate::executor::ScopedExecutor;
use crate::preview;
use crate::proposal::{ExecutionStep, ProposalStatus, ProposalStore, Scope, TerminalOutcome};
use crate::registry::CapabilityRegistry;
use crate::token::{token_digest, IssuedToken, RevokeTarget, TokenStore};

pub const PROPOSALS_FILE: &str = "proposals.jsonl";
pub const TOKENS_FILE: &str = "tokens.jsonl";
pub const AUDIT_DIR: &str = "audit";

/// Where a proposal stands, as seen by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Proposed,
    Approved,
    Executed,
    Denied,
    Revoked,
}

/// Every accepted `(state, verb) -> state` move.
const TRANSITIONS: &[(TurnState, Verb, TurnState)] = &[
    (TurnState::Idle, Verb::Propose, TurnState::Proposed),
    (TurnState::Proposed, Verb::Approve, TurnState::Approved),
    (TurnState::Proposed, Verb::Deny, TurnState::Denied),
    (TurnState::Proposed, Verb::Revoke, TurnState::Revoked),
    (TurnState::Approved, Verb::Revoke, TurnState::Revoked),
    (TurnState::Approved, Verb::Execute, TurnState::Executed),
];

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Proposed => "proposed",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Denied => "denied",
            Self::Revoked => "revoked",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Denied | Self::Revoked)
    }

    /// The state `verb` leads to, if the table allows it.
    pub fn next(self, verb: Verb) -> Option<TurnState> {
        TRANSITIONS
            .iter()
            .find(|(from, v, _)| *from == self && *v == verb)
            .map(|(_, _, to)| *to)
    }

    /// Why `verb` is refused in this state.
    pub fn refusal(self, verb: Verb) -> Denial {
        match (self, verb) {
            (_, Verb::Execute) => Denial::InvalidToken,
            (Self::Idle, _) => Denial::UnknownProposal,
            (Self::Approved, _) => Denial::AlreadyApproved,
            (state, _) if state.is_terminal() => Denial::ProposalTerminal,
            _ => Denial::MalformedCommand,
        }
    }

    /// Apply the table, turning a missing move into its denial.
    pub fn advance(self, verb: Verb) -> GovResult<TurnState> {
        self.next(verb).ok_or_else(|| {
            GovernanceError::denied(
                self.refusal(verb),
                format!("{} is not allowed while {}", verb.as_str(), self.as_str()),
            )
        })
    }
}

/// Result of a turn that was handled, including denials.
#[derive(Debug)]
pub struct Turn {
    pub artifact: Artifact,
    /// Set only by a successful approve. The raw value is shown once.
    pub issued_token: Option<IssuedToken>,
    pub state: TurnState,
}

/// A turn that hit an infrastructure fault. The artifact is still a
/// denial carrying the `internal_error` reason.
#[derive(Debug, Error)]
#[error("governance turn failed: {error}")]
pub struct TurnFailure {
    pub artifact: Artifact,
    #[source]
    pub error: Error,
}

/// What a turn learned before it failed, for the denial artifact.
#[derive(Debug, Default)]
struct TurnContext {
    verb: Option<Verb>,
    proposal_id: Option<String>,
    capability: Option<String>,
    token_digest: Option<String>,
    state: Option<TurnState>,
}

/// Turn state machine over the governance stores.
pub struct GovernanceProtocol {
    registry: Arc<CapabilityRegistry>,
    proposals: Arc<ProposalStore>,
    tokens: Arc<TokenStore>,
    audit: Arc<AuditLog>,
    executor: ScopedExecutor,
    sink: Arc<dyn ArtifactSink>,
    clock: SharedClock,
    cwd: PathBuf,
}

impl GovernanceProtocol {
    /// Open the file-backed stores under the configured data directory.
    pub fn open(
        config: &WardenConfig,
        registry: CapabilityRegistry,
        clock: SharedClock,
    ) -> Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            Error::Storage(format!("Failed to create {}: {e}", data_dir.display()))
        })?;
        let registry = Arc::new(registry);
        let lock_timeout = config.lock_timeout();
        let proposals = Arc::new(ProposalStore::open(
            &data_dir.join(PROPOSALS_FILE),
            lock_timeout,
            registry.clone(),
            clock.clone(),
        )?);
        let tokens = Arc::new(TokenStore::open(
            &data_dir.join(TOKENS_FILE),
            lock_timeout,
            clock.clone(),
            config.token_ttl(),
        )?);
        let audit = Arc::new(AuditLog::open(
            &data_dir.join(AUDIT_DIR),
            lock_timeout,
            clock.clone(),
        )?);
        tracing::info!(data_dir = %data_dir.display(), capabilities = registry.len(), "Governance stores opened");
        Self::assemble(config, registry, proposals, tokens, audit, clock)
    }

    /// Stores that live only in memory.
    pub fn in_memory(
        config: &WardenConfig,
        registry: CapabilityRegistry,
        clock: SharedClock,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let proposals = Arc::new(ProposalStore::in_memory(registry.clone(), clock.clone()));
        let tokens = Arc::new(TokenStore::in_memory(clock.clone(), config.token_ttl()));
        let audit = Arc::new(AuditLog::in_memory(clock.clone()));
        Self::assemble(config, registry, proposals, tokens, audit, clock)
    }

    fn assemble(
        config: &WardenConfig,
        registry: Arc<CapabilityRegistry>,
        proposals: Arc<ProposalStore>,
        tokens: Arc<TokenStore>,
        audit: Arc<AuditLog>,
        clock: SharedClock,
    ) -> Result<Self> {
        let executor = ScopedExecutor::new(
            registry.clone(),
            proposals.clone(),
            tokens.clone(),
            clock.clone(),
        )
        .with_config(config);
        Ok(Self {
            registry,
            proposals,
            tokens,
            audit,
            executor,
            sink: Arc::new(NullSink),
            clock,
            cwd: std::env::current_dir()?,
        })
    }

    /// Hand every artifact to `sink` as well as returning it.
    pub fn with_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Directory relative paths in commands resolve against.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn proposals(&self) -> &ProposalStore {
        &self.proposals
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Current state of a proposal.
    pub fn state(&self, proposal_id: &str) -> GovResult<TurnState> {
        Ok(match self.proposals.status(proposal_id)? {
            ProposalStatus::Pending => {
                if self.tokens.valid_for_proposal(proposal_id)?.is_some() {
                    TurnState::Approved
                } else {
                    TurnState::Proposed
                }
            }
            ProposalStatus::Terminal(TerminalOutcome::Executed) => TurnState::Executed,
            ProposalStatus::Terminal(TerminalOutcome::Denied) => TurnState::Denied,
            ProposalStatus::Terminal(TerminalOutcome::Revoked) => TurnState::Revoked,
        })
    }

    /// Handle one command line for `session_id`.
    pub async fn handle(
        &self,
        session_id: &str,
        line: &str,
    ) -> std::result::Result<Turn, TurnFailure> {
        let mut ctx = TurnContext::default();
        let result = match command::parse(line, &self.cwd) {
            Ok(cmd) => {
                ctx.verb = Some(cmd.verb());
                self.dispatch(session_id, cmd, &mut ctx).await
            }
            Err(e) => {
                ctx.verb = e.verb;
                ctx.proposal_id = e.proposal_id.filter(|id| self.is_stored(id));
                Err(GovernanceError::denied(Denial::MalformedCommand, e.detail))
            }
        };

        let outcome = match result {
            Ok(turn) => Ok(turn),
            Err(GovernanceError::Denied { denial, detail }) => {
                self.refuse(session_id, &ctx, denial, &detail)
            }
            Err(GovernanceError::Infrastructure(error)) => Err(self.fail(session_id, &ctx, error)),
        };

        let artifact = match &outcome {
            Ok(turn) => &turn.artifact,
            Err(failure) => &failure.artifact,
        };
        if let Err(e) = self.sink.persist(artifact) {
            tracing::warn!(artifact = artifact.kind(), error = %e, "Artifact sink failed");
        }
        outcome
    }

    /// Whether `id` names a stored proposal. Anything else an operator typed
    /// in that position stays out of artifacts and audit.
    fn is_stored(&self, id: &str) -> bool {
        self.proposals.status(id).is_ok()
    }

    async fn dispatch(
        &self,
        session_id: &str,
        cmd: TurnCommand,
        ctx: &mut TurnContext,
    ) -> GovResult<Turn> {
        match cmd {
            TurnCommand::Propose {
                capability,
                scope,
                steps,
                summary,
            } => self.propose(session_id, capability, scope, steps, summary, ctx),
            TurnCommand::Approve { proposal_id } => self.approve(session_id, proposal_id, ctx),
            TurnCommand::Deny { proposal_id } => self.deny(session_id, proposal_id, ctx),
            TurnCommand::Revoke { target } => self.revoke(session_id, &target, ctx),
            TurnCommand::Execute { proposal_id, token } => {
                self.execute(session_id, proposal_id, &token, ctx).await
            }
        }
    }

    fn propose(
        &self,
        session_id: &str,
        capability: String,
        scope: Scope,
        steps: Vec<ExecutionStep>,
        summary: Option<String>,
        ctx: &mut TurnContext,
    ) -> GovResult<Turn> {
        ctx.capability = self.registry.lookup(&capability).ok().map(|c| c.name.clone());
        ctx.state = Some(TurnState::Idle);
        let next = TurnState::Idle.advance(Verb::Propose)?;

        let proposal = self
            .proposals
            .create(&capability, scope, steps, session_id, summary)?;
        ctx.proposal_id = Some(proposal.id.clone());
        let preview = preview::render(&proposal.steps);

        self.audit.record(
            NewEvent::new(
                AuditEventType::Proposed,
                &proposal.id,
                proposal
                    .summary
                    .clone()
                    .unwrap_or_else(|| "proposal created".into()),
            )
            .capability(&proposal.capability)
            .session(session_id)
            .payload(json!({ "scope": proposal.scope, "steps": proposal.steps })),
        )?;

        Ok(Turn {
            artifact: Artifact::ProposalAction {
                proposal_id: proposal.id,
                capability: proposal.capability,
                scope: proposal.scope,
                steps: proposal.steps,
                requires_approval: true,
                no_autonomy: true,
                created_at: proposal.created_at,
                summary: proposal.summary,
                preview,
            },
            issued_token: None,
            state: next,
        })
    }

    /// Pick the proposal an approve or deny applies to. Without an id the
    /// session must have exactly one pending proposal.
    fn resolve_target(
        &self,
        session_id: &str,
        proposal_id: Option<String>,
        ctx: &mut TurnContext,
    ) -> GovResult<String> {
        if let Some(id) = proposal_id {
            return Ok(id);
        }
        let pending: Vec<_> = self
            .proposals
            .list_pending()?
            .into_iter()
            .filter(|p| p.session_id == session_id)
            .collect();
        match pending.as_slice() {
            [] => Err(GovernanceError::denied(
                Denial::UnknownProposal,
                "no pending proposal in this session",
            )),
            [only] => {
                ctx.proposal_id = Some(only.id.clone());
                Ok(only.id.clone())
            }
            several => Err(GovernanceError::denied(
                Denial::MalformedCommand,
                format!("{} pending proposals; name one", several.len()),
            )),
        }
    }

    fn approve(
        &self,
        session_id: &str,
        proposal_id: Option<String>,
        ctx: &mut TurnContext,
    ) -> GovResult<Turn> {
        let id = self.resolve_target(session_id, proposal_id, ctx)?;
        let proposal = self.proposals.get(&id)?;
        ctx.proposal_id = Some(id.clone());
        ctx.capability = Some(proposal.capability.clone());
        let state = self.state(&id)?;
        ctx.state = Some(state);
        let next = state.advance(Verb::Approve)?;

        let issued = self.tokens.issue(&self.proposals, &id)?;
        let token = &issued.token;
        ctx.token_digest = Some(token.token_digest.clone());

        self.audit.record(
            NewEvent::new(AuditEventType::Approved, &id, "approval token issued")
                .capability(&proposal.capability)
                .token_digest(&token.token_digest)
                .session(session_id)
                .payload(json!({
                    "token_id": token.token_id,
                    "expires_at": token.expires_at,
                })),
        )?;

        let artifact = Artifact::ApprovalToken {
            proposal_id: id,
            token_id: token.token_id.clone(),
            token_digest: token.token_digest.clone(),
            issued_at: token.issued_at,
            expires_at: token.expires_at,
        };
        Ok(Turn {
            artifact,
            issued_token: Some(issued),
            state: next,
        })
    }

    fn deny(
        &self,
        session_id: &str,
        proposal_id: Option<String>,
        ctx: &mut TurnContext,
    ) -> GovResult<Turn> {
        let id = self.resolve_target(session_id, proposal_id, ctx)?;
        let proposal = self.proposals.get(&id)?;
        ctx.proposal_id = Some(id.clone());
        ctx.capability = Some(proposal.capability.clone());
        let state = self.state(&id)?;
        ctx.state = Some(state);
        let next = state.advance(Verb::Deny)?;

        // A token issued by another handle since the state check dies with
        // the proposal.
        let revocation = self.proposals.with_pending(&id, Some(TerminalOutcome::Denied), || {
            self.tokens.revoke(RevokeTarget::Proposal(id.clone()))
        })?;
        let mut event = NewEvent::new(AuditEventType::Denied, &id, "proposal denied by operator")
            .capability(&proposal.capability)
            .session(session_id)
            .payload(json!({
                "reason": "denied_by_user",
                "revoked_tokens": revocation.revoked.len(),
            }));
        if let Some(token) = revocation.revoked.first() {
            event = event.token_digest(&token.token_digest);
        }
        self.audit.record(event)?;

        Ok(Turn {
            artifact: Artifact::denied(
                Some(&id),
                "denied_by_user",
                "Denied by the operator",
                self.clock.now(),
            ),
            issued_token: None,
            state: next,
        })
    }

    /// `all`, an existing proposal id, or else a token value or digest.
    fn revoke_target(&self, raw: &str) -> GovResult<RevokeTarget> {
        if raw.eq_ignore_ascii_case("all") {
            return Ok(RevokeTarget::All);
        }
        match self.proposals.status(raw) {
            Ok(_) => Ok(RevokeTarget::Proposal(raw.to_string())),
            Err(GovernanceError::Denied { .. }) => Ok(RevokeTarget::Token(raw.to_string())),
            Err(e) => Err(e),
        }
    }

    fn revoke(&self, session_id: &str, raw: &str, ctx: &mut TurnContext) -> GovResult<Turn> {
        let target = self.revoke_target(raw)?;
        if let RevokeTarget::Proposal(id) = &target {
            ctx.proposal_id = Some(id.clone());
        }

        let mut revocation = self.tokens.revoke(target.clone())?;

        let mut affected: BTreeSet<String> = revocation
            .revoked
            .iter()
            .map(|t| t.proposal_id.clone())
            .collect();
        if let RevokeTarget::Proposal(id) = &target {
            affected.insert(id.clone());
        }

        let mut finished = Vec::new();
        for id in &affected {
            if self.state(id)?.next(Verb::Revoke).is_none() {
                continue;
            }
            // Anything issued since the sweep above is revoked with it.
            let finish = self.proposals.with_pending(id, Some(TerminalOutcome::Revoked), || {
                self.tokens.revoke(RevokeTarget::Proposal(id.clone()))
            });
            match finish {
                Ok(late) => {
                    revocation.revoked.extend(late.revoked);
                    finished.push(id.clone());
                }
                Err(GovernanceError::Denied { denial, detail }) => {
                    tracing::warn!(proposal_id = %id, reason = denial.code(), detail = %detail, "Proposal not revoked");
                }
                Err(e) => return Err(e),
            }
        }

        // One event per revoked token; proposals revoked without a token get
        // their own. Keys make a repeated revoke record nothing new.
        for token in &revocation.revoked {
            self.audit.record(
                NewEvent::new(AuditEventType::Revoked, &token.proposal_id, "approval token revoked")
                    .token_digest(&token.token_digest)
                    .session(session_id)
                    .payload(json!({ "target_kind": target.kind() }))
                    .dedup_key(format!("revoke:token:{}", token.token_digest)),
            )?;
        }
        for id in &finished {
            if revocation.revoked.iter().any(|t| &t.proposal_id == id) {
                continue;
            }
            self.audit.record(
                NewEvent::new(AuditEventType::Revoked, id, "proposal revoked")
                    .session(session_id)
                    .payload(json!({ "target_kind": target.kind() }))
                    .dedup_key(RevokeTarget::Proposal(id.clone()).digest()),
            )?;
        }

        let state = match &target {
            RevokeTarget::Proposal(id) => self.state(id)?,
            _ if !finished.is_empty() => TurnState::Revoked,
            _ => TurnState::Idle,
        };
        tracing::info!(
            target_kind = target.kind(),
            target = %target.digest(),
            revoked = revocation.revoked.len(),
            proposals = finished.len(),
            "Revocation handled"
        );

        Ok(Turn {
            artifact: Artifact::RevokedToken {
                target_kind: target.kind().to_string(),
                target_id: target.identity(),
                revoked_at: self.clock.now(),
                revoked_count: revocation.revoked.len(),
            },
            issued_token: None,
            state,
        })
    }

    async fn execute(
        &self,
        session_id: &str,
        proposal_id: String,
        token: &str,
        ctx: &mut TurnContext,
    ) -> GovResult<Turn> {
        ctx.token_digest = Some(token_digest(token));
        let proposal = self.proposals.get(&proposal_id)?;
        ctx.proposal_id = Some(proposal_id.clone());
        ctx.capability = Some(proposal.capability.clone());
        let state = self.state(&proposal_id)?;
        ctx.state = Some(state);
        let next = state.advance(Verb::Execute)?;

        let report = self.executor.run(&proposal, &proposal.steps, token).await?;
        let success = report.success();
        let summary = report.summary();

        self.audit.record(
            NewEvent::new(AuditEventType::Executed, &proposal_id, &summary)
                .capability(&proposal.capability)
                .token_digest(&report.token_digest)
                .session(session_id)
                .payload(json!({ "success": success, "results": report.results })),
        )?;

        Ok(Turn {
            artifact: Artifact::ExecutedAction {
                proposal_id,
                token_digest: report.token_digest,
                outcome: if success {
                    ExecutionOutcome::Success
                } else {
                    ExecutionOutcome::Failure
                },
                result_summary: summary,
                executed_at: report.executed_at,
                error: (!success).then(|| "step_failed".to_string()),
                results: report.results,
            },
            issued_token: None,
            state: next,
        })
    }

    /// Turn a governance denial into its artifact and audit event.
    fn refuse(
        &self,
        session_id: &str,
        ctx: &TurnContext,
        denial: Denial,
        detail: &str,
    ) -> std::result::Result<Turn, TurnFailure> {
        let verb = ctx.verb.map_or("unknown", Verb::as_str);
        tracing::warn!(
            verb,
            session_id,
            proposal_id = ctx.proposal_id.as_deref().unwrap_or("none"),
            reason = denial.code(),
            detail = %redact_text(detail).0,
            "Turn denied"
        );

        let now = self.clock.now();
        let artifact = match ctx.verb {
            Some(Verb::Execute) => Artifact::execution_failed(
                ctx.proposal_id.as_deref(),
                ctx.token_digest.as_deref(),
                denial.code(),
                denial.message(),
                now,
            ),
            _ => Artifact::denied(
                ctx.proposal_id.as_deref(),
                denial.code(),
                denial.message(),
                now,
            ),
        };

        if let Err(error) = self.audit.record(self.denial_event(session_id, ctx, denial.code())) {
            return Err(self.fail(session_id, ctx, error));
        }

        Ok(Turn {
            artifact,
            issued_token: None,
            state: ctx.state.unwrap_or(TurnState::Idle),
        })
    }

    /// Infrastructure fault: best-effort audit, then an `internal_error`
    /// denial.
    fn fail(&self, session_id: &str, ctx: &TurnContext, error: Error) -> TurnFailure {
        tracing::error!(
            verb = ctx.verb.map_or("unknown", Verb::as_str),
            proposal_id = ctx.proposal_id.as_deref().unwrap_or("none"),
            kind = error.kind(),
            error = %error,
            "Turn failed"
        );
        if let Err(e) = self.audit.record(self.denial_event(session_id, ctx, INTERNAL_ERROR)) {
            tracing::error!(error = %e, "Audit of failed turn also failed");
        }
        TurnFailure {
            artifact: Artifact::denied(
                ctx.proposal_id.as_deref(),
                INTERNAL_ERROR,
                format!("internal error ({})", error.kind()),
                self.clock.now(),
            ),
            error,
        }
    }

    fn denial_event(&self, session_id: &str, ctx: &TurnContext, reason: &str) -> NewEvent {
        let verb = ctx.verb.map_or("unknown", Verb::as_str);
        let mut event = NewEvent::new(
            AuditEventType::Denied,
            ctx.proposal_id.as_deref().unwrap_or(NO_PROPOSAL),
            format!("{verb} denied: {reason}"),
        )
        .session(session_id)
        .payload(json!({ "verb": verb, "reason": reason }));
        if let Some(capability) = &ctx.capability {
            event = event.capability(capability);
        }
        if let Some(digest) = &ctx.token_digest {
            event = event.token_digest(digest);
        }
        event
    }
}
