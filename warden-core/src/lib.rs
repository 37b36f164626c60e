//! Warden Core - deterministic action governance.
//!
//! Decides whether a requested side effect (scoped file write, scoped
//! command) may run:
//! - [`CapabilityRegistry`]: static capability policies
//! - [`ProposalStore`]: immutable proposals and their lifecycle
//! - [`TokenStore`]: single-use approval tokens, stored as digests
//! - [`policy`]: the one decision function shared by creation and execution
//! - [`preview`]: what a proposal would change, shown before approval
//! - [`ScopedExecutor`]: runs exactly the approved steps
//! - [`AuditLog`]: redacted append-only trail
//! - [`GovernanceProtocol`]: the turn state machine tying them together

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod artifact;
pub mod audit;
pub mod command;
pub mod error;
pub mod executor;
pub mod policy;
pub mod preview;
pub mod proposal;
pub mod protocol;
pub mod registry;
pub mod token;

pub use artifact::{Artifact, ArtifactSink, ExecutionOutcome, JsonlSink, NullSink, RecordingSink};
pub use audit::{AuditEvent, AuditEventType, AuditLog};
pub use error::{Denial, GovResult, GovernanceError};
pub use executor::{ExecutionReport, ScopedExecutor};
pub use proposal::{ExecutionStep, Proposal, ProposalStatus, ProposalStore, Scope};
pub use protocol::{GovernanceProtocol, Turn, TurnFailure, TurnState};
pub use registry::{Capability, CapabilityRegistry, OperationKind, RiskTier};
pub use token::{ApprovalToken, IssuedToken, RevokeTarget, TokenStore};
