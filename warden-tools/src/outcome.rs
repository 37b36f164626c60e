//! Result of performing one governed operation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw result of one operation, as handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// File written in full.
    Wrote { path: PathBuf, bytes: u64 },
    /// Process ran to completion (any exit code).
    Ran {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// Process was killed after the configured timeout.
    TimedOut { after_secs: u64 },
    /// Operation could not be performed.
    Failed { error: String },
}

impl OperationOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    /// Successful write or a zero exit status.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Wrote { .. } => true,
            Self::Ran { exit_code, .. } => *exit_code == 0,
            Self::TimedOut { .. } | Self::Failed { .. } => false,
        }
    }

    /// One-line description for artifacts and audit records.
    pub fn summary(&self) -> String {
        match self {
            Self::Wrote { path, bytes } => format!("wrote {bytes} bytes to {}", path.display()),
            Self::Ran { exit_code, .. } => format!("exited with code {exit_code}"),
            Self::TimedOut { after_secs } => format!("timed out after {after_secs}s"),
            Self::Failed { error } => format!("failed: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_classification() {
        assert!(OperationOutcome::Wrote {
            path: "/tmp/a".into(),
            bytes: 3
        }
        .is_success());
        assert!(OperationOutcome::Ran {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new()
        }
        .is_success());
        assert!(!OperationOutcome::Ran {
            exit_code: 2,
            stdout: String::new(),
            stderr: String::new()
        }
        .is_success());
        assert!(!OperationOutcome::TimedOut { after_secs: 30 }.is_success());
        assert!(!OperationOutcome::failed("boom").is_success());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(OperationOutcome::TimedOut { after_secs: 5 }).unwrap();
        assert_eq!(json["kind"], "timed_out");
        assert_eq!(json["after_secs"], 5);
    }

    #[test]
    fn summaries() {
        assert_eq!(
            OperationOutcome::Wrote {
                path: "/data/q3.txt".into(),
                bytes: 12
            }
            .summary(),
            "wrote 12 bytes to /data/q3.txt"
        );
        assert_eq!(
            OperationOutcome::failed("no such file").summary(),
            "failed: no such file"
        );
    }
}
