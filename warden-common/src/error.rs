//! Error types for the Warden governance core.
//!
//! These are infrastructure faults: anything that is not a governance
//! decision. Governance denials live in `warden-core`.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the Warden error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified infrastructure error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent storage could not be read or written
    #[error("Storage unavailable: {0}")]
    Storage(String),

    /// Advisory lock could not be acquired in time
    #[error("Timed out acquiring lock on {}", path.display())]
    LockTimeout { path: PathBuf },

    /// A stored record could not be decoded
    #[error("Corrupt record in {} at line {line}: {reason}", path.display())]
    CorruptRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if this is a lock timeout, possibly wrapped in context.
    pub fn is_lock_timeout(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::WithContext { source, .. } => source.is_lock_timeout(),
            _ => false,
        }
    }

    /// Stable category name for logs and denial artifacts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Storage(_) | Self::Io(_) | Self::CorruptRecord { .. } => "storage",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Json(_) => "serialization",
            Self::Internal(_) => "internal",
            Self::WithContext { source, .. } => source.kind(),
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
