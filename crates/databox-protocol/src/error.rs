//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Core error: {0}")]
    Core(#[from] databox_core::Error),
}

impl From<ProtocolError> for databox_core::Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Core(e) => e,
            other => databox_core::Error::InvalidRequest(other.to_string()),
        }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
