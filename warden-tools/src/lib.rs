//! Warden Tools - the governed operation kinds.
//!
//! Provides the two operations a proposal can carry out:
//! - Scoped file writes
//! - Scoped command execution (no shell, filtered environment, timeout)
//!
//! plus the path and command canonicalization the policy layer compares on.

pub mod file_write;
pub mod outcome;
pub mod security;
pub mod shell;

pub use file_write::ScopedFileWriter;
pub use outcome::OperationOutcome;
pub use shell::ScopedShell;
