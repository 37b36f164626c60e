//! Configuration validation.
//!
//! Field-level checks so a bad config file fails at startup instead of at
//! the first governed action.

use thiserror::Error;

use crate::config::{ObservabilityConfig, WardenConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Validate for WardenConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.token_ttl_secs == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "token_ttl_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }

        if self.command_timeout_secs == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "command_timeout_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }

        if self.max_write_bytes == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "max_write_bytes".into(),
                reason: "must be greater than zero".into(),
            });
        }

        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}
