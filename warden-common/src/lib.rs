//! Warden Common - shared infrastructure for the Warden governance core.
//!
//! This crate provides:
//! - Configuration types, loading and validation
//! - The infrastructure error type
//! - Logging setup
//! - Secret redaction for persisted records
//! - A clock abstraction for deterministic tests
//! - Append-only JSONL journals with advisory file locking

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod redact;
pub mod storage;
pub mod util;
pub mod validation;

pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use config::{ObservabilityConfig, WardenConfig};
pub use error::{Error, Result, ResultExt};
pub use storage::{atomic_write, FileLock, Journal};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::clock::{Clock, SharedClock};
    pub use crate::config::WardenConfig;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
    pub use crate::storage::Journal;
    pub use crate::validation::Validate;
}
