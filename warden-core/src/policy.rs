//! Policy enforcement.
//!
//! [`check_step`] is the single containment function per operation kind.
//! It runs when a proposal is created and again, through [`decide`], on
//! every execution attempt. Nothing is cached between the two.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use warden_tools::security::{
    canonical_command, has_nul, is_strict_descendant, is_within, normalize_command_line,
    resolve_in_cwd,
};

use crate::error::{Denial, GovResult, GovernanceError};
use crate::proposal::{ExecutionStep, Proposal, ProposalStatus, Scope};
use crate::registry::Capability;
use crate::token::ApprovalToken;

/// A step whose parameters have been canonicalized and approved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedStep {
    WriteFile {
        path: PathBuf,
        content: String,
    },
    RunCommand {
        program: String,
        args: Vec<String>,
        cwd: PathBuf,
        command: String,
    },
}

/// Everything `decide` looks at besides the proposal and step.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub capability: &'a Capability,
    pub status: ProposalStatus,
    /// The presented token, if it validated.
    pub token: Option<&'a ApprovalToken>,
    pub now: DateTime<Utc>,
}

/// Outcome of a policy decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(ResolvedStep),
    Deny { denial: Denial, detail: String },
}

impl Decision {
    pub fn into_result(self) -> GovResult<ResolvedStep> {
        match self {
            Self::Allow(step) => Ok(step),
            Self::Deny { denial, detail } => Err(GovernanceError::Denied { denial, detail }),
        }
    }
}

/// Decide whether `step` of `proposal` may run now.
///
/// Order: token valid and bound to this proposal, proposal still open,
/// then containment. A replayed token is reported as `InvalidToken` even
/// when its proposal has since finished.
pub fn decide(ctx: &DecisionContext<'_>, proposal: &Proposal, step: &ExecutionStep) -> Decision {
    match ctx.token {
        Some(token) if token.proposal_id == proposal.id && token.is_valid_at(ctx.now) => {}
        Some(_) => {
            return Decision::Deny {
                denial: Denial::InvalidToken,
                detail: "token not valid for this proposal".into(),
            }
        }
        None => {
            return Decision::Deny {
                denial: Denial::InvalidToken,
                detail: "no valid token presented".into(),
            }
        }
    }
    if ctx.status.is_terminal() {
        return Decision::Deny {
            denial: Denial::ProposalTerminal,
            detail: format!("{} is finished", proposal.id),
        };
    }
    if ctx.capability.name != proposal.capability {
        return Decision::Deny {
            denial: Denial::ScopeViolation,
            detail: format!(
                "capability {} does not govern proposal for {}",
                ctx.capability.name, proposal.capability
            ),
        };
    }
    match check_step(ctx.capability, &proposal.scope, step) {
        Ok(resolved) => Decision::Allow(resolved),
        Err(GovernanceError::Denied { denial, detail }) => Decision::Deny { denial, detail },
        Err(GovernanceError::Infrastructure(e)) => Decision::Deny {
            denial: Denial::ScopeViolation,
            detail: e.to_string(),
        },
    }
}

/// Scope-level checks done once at creation.
pub fn check_scope(cap: &Capability, scope: &Scope) -> GovResult<()> {
    if scope.kind() != cap.kind {
        return Err(GovernanceError::denied(
            Denial::ScopeViolation,
            format!(
                "{} scope for {} capability {}",
                scope.kind().as_str(),
                cap.kind.as_str(),
                cap.name
            ),
        ));
    }
    if scope.is_empty() {
        return Err(GovernanceError::denied(
            Denial::ScopeViolation,
            "scope declares nothing",
        ));
    }
    match scope {
        Scope::Paths(paths) => {
            for raw in paths {
                let resolved = resolve_checked(raw)?;
                check_roots(cap, &resolved)?;
            }
        }
        Scope::Commands(commands) => {
            for command in commands {
                let normalized = normalize_command_line(command)
                    .map_err(|e| GovernanceError::denied(Denial::MalformedCommand, e))?;
                check_patterns(cap, &normalized)?;
            }
        }
    }
    Ok(())
}

/// Containment of one step in the declared scope plus registry limits.
pub fn check_step(cap: &Capability, scope: &Scope, step: &ExecutionStep) -> GovResult<ResolvedStep> {
    if step.kind() != cap.kind || scope.kind() != cap.kind {
        return Err(GovernanceError::denied(
            Denial::ScopeViolation,
            format!(
                "{} step under {} capability {}",
                step.kind().as_str(),
                cap.kind.as_str(),
                cap.name
            ),
        ));
    }

    match (step, scope) {
        (ExecutionStep::WriteFile { path, content }, Scope::Paths(scope_paths)) => {
            let resolved = resolve_checked(path)?;
            let contained = scope_paths
                .iter()
                .map(|p| resolve_in_cwd(p))
                .any(|scope_path| is_strict_descendant(&resolved, &scope_path));
            if !contained {
                return Err(GovernanceError::denied(
                    Denial::ScopeViolation,
                    format!("{} is not inside the declared paths", resolved.display()),
                ));
            }
            check_roots(cap, &resolved)?;
            Ok(ResolvedStep::WriteFile {
                path: resolved,
                content: content.clone(),
            })
        }
        (ExecutionStep::RunCommand { program, args, cwd }, Scope::Commands(scope_commands)) => {
            if program.trim().is_empty() {
                return Err(GovernanceError::denied(
                    Denial::MalformedCommand,
                    "empty program",
                ));
            }
            let command = canonical_command(program, args);
            let declared = scope_commands
                .iter()
                .filter_map(|c| normalize_command_line(c).ok())
                .any(|c| c == command);
            if !declared {
                return Err(GovernanceError::denied(
                    Denial::ScopeViolation,
                    format!("`{command}` is not a declared command"),
                ));
            }
            check_patterns(cap, &command)?;

            let cwd = resolve_checked(cwd)?;
            check_roots(cap, &cwd)?;
            Ok(ResolvedStep::RunCommand {
                program: program.trim().to_string(),
                args: args.clone(),
                cwd,
                command,
            })
        }
        // Kinds were compared above.
        _ => Err(GovernanceError::denied(
            Denial::ScopeViolation,
            "step and scope kinds differ",
        )),
    }
}

fn resolve_checked(path: &Path) -> GovResult<PathBuf> {
    let raw = path.to_string_lossy();
    if raw.trim().is_empty() || has_nul(&raw) {
        return Err(GovernanceError::denied(
            Denial::MalformedCommand,
            "empty or invalid path",
        ));
    }
    Ok(resolve_in_cwd(path))
}

/// Inside an allowed root and not under a protected prefix. A capability
/// without roots allows no paths.
fn check_roots(cap: &Capability, resolved: &Path) -> GovResult<()> {
    if !cap.allowed_roots.iter().any(|root| is_within(resolved, root)) {
        return Err(GovernanceError::denied(
            Denial::PathOutsideRoots,
            format!("{} is outside the roots of {}", resolved.display(), cap.name),
        ));
    }
    if let Some(protected) = cap
        .protected_paths
        .iter()
        .find(|p| is_within(resolved, p))
    {
        return Err(GovernanceError::denied(
            Denial::ProtectedPathViolation,
            format!("{} is under {}", resolved.display(), protected.display()),
        ));
    }
    Ok(())
}

fn check_patterns(cap: &Capability, command: &str) -> GovResult<()> {
    if !cap.allow_patterns.is_empty() && !cap.allow_patterns.iter().any(|p| p.is_match(command)) {
        return Err(GovernanceError::denied(
            Denial::CommandDenylisted,
            format!("`{command}` matches no allow pattern"),
        ));
    }
    if let Some(pattern) = cap.deny_patterns.iter().find(|p| p.is_match(command)) {
        return Err(GovernanceError::denied(
            Denial::CommandDenylisted,
            format!("`{command}` matches deny pattern {}", pattern.as_str()),
        ));
    }
    Ok(())
}
