//! Governance denials and the error type every core operation returns.
//!
//! A [`Denial`] is a governance decision and is always turned into a
//! denial-shaped artifact. Anything else is an infrastructure fault from
//! `warden-common` and surfaces to the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a governance request was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    #[error("unknown capability")]
    UnknownCapability,
    #[error("capability is disabled")]
    DisabledCapability,
    #[error("step is outside the approved scope")]
    ScopeViolation,
    #[error("approval token is not valid")]
    InvalidToken,
    #[error("path is outside the allowed roots")]
    PathOutsideRoots,
    #[error("path is protected")]
    ProtectedPathViolation,
    #[error("command is not permitted")]
    CommandDenylisted,
    #[error("proposal is already finished")]
    ProposalTerminal,
    #[error("command could not be understood")]
    MalformedCommand,
    #[error("no such proposal")]
    UnknownProposal,
    #[error("proposal already has a valid approval")]
    AlreadyApproved,
}

impl Denial {
    /// Stable machine-readable reason code.
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownCapability => "unknown_capability",
            Self::DisabledCapability => "disabled_capability",
            Self::ScopeViolation => "scope_violation",
            Self::InvalidToken => "invalid_token",
            Self::PathOutsideRoots => "path_outside_roots",
            Self::ProtectedPathViolation => "protected_path_violation",
            Self::CommandDenylisted => "command_denylisted",
            Self::ProposalTerminal => "proposal_terminal",
            Self::MalformedCommand => "malformed_command",
            Self::UnknownProposal => "unknown_proposal",
            Self::AlreadyApproved => "already_approved",
        }
    }

    /// Category explanation safe to show to the operator.
    pub fn message(self) -> String {
        self.to_string()
    }
}

/// Error returned by every governance operation.
#[derive(Error, Debug)]
pub enum GovernanceError {
    /// Refused by policy. `detail` is for logs only.
    #[error("{denial}: {detail}")]
    Denied { denial: Denial, detail: String },

    /// Storage, locking or serialization fault.
    #[error(transparent)]
    Infrastructure(#[from] warden_common::Error),
}

impl GovernanceError {
    pub fn denied(denial: Denial, detail: impl Into<String>) -> Self {
        Self::Denied {
            denial,
            detail: detail.into(),
        }
    }

    /// The denial, if this is a governance refusal.
    pub fn denial(&self) -> Option<Denial> {
        match self {
            Self::Denied { denial, .. } => Some(*denial),
            Self::Infrastructure(_) => None,
        }
    }
}

impl From<Denial> for GovernanceError {
    fn from(denial: Denial) -> Self {
        Self::denied(denial, denial.code())
    }
}

impl From<std::io::Error> for GovernanceError {
    fn from(e: std::io::Error) -> Self {
        Self::Infrastructure(e.into())
    }
}

impl From<serde_json::Error> for GovernanceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Infrastructure(e.into())
    }
}

/// Result alias for governance operations.
pub type GovResult<T> = std::result::Result<T, GovernanceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL: [Denial; 11] = [
        Denial::UnknownCapability,
        Denial::DisabledCapability,
        Denial::ScopeViolation,
        Denial::InvalidToken,
        Denial::PathOutsideRoots,
        Denial::ProtectedPathViolation,
        Denial::CommandDenylisted,
        Denial::ProposalTerminal,
        Denial::MalformedCommand,
        Denial::UnknownProposal,
        Denial::AlreadyApproved,
    ];

    #[test]
    fn codes_are_unique_and_match_serde() {
        let codes: HashSet<_> = ALL.iter().map(|d| d.code()).collect();
        assert_eq!(codes.len(), ALL.len());
        for denial in ALL {
            let json = serde_json::to_value(denial).unwrap();
            assert_eq!(json, denial.code());
        }
    }

    #[test]
    fn messages_are_non_empty() {
        for denial in ALL {
            assert!(!denial.message().is_empty());
        }
    }

    #[test]
    fn denial_accessor() {
        let err = GovernanceError::denied(Denial::ScopeViolation, "/etc/passwd");
        assert_eq!(err.denial(), Some(Denial::ScopeViolation));

        let infra = GovernanceError::from(warden_common::Error::Storage("down".into()));
        assert_eq!(infra.denial(), None);
    }
}
