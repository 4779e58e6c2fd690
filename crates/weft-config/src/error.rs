//! Configuration error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {field}: {reason}")]
    ValidationError { field: &'static str, reason: String },
}
