//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding client messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The request envelope itself could not be parsed
    #[error("Error unmarshalling message: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The payload did not match the shape expected for its request type
    #[error("Error unmarshalling {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// The payload parsed but failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Shorthand for a validation failure on a missing or empty field
    pub fn missing_field(field: &str) -> Self {
        Self::Validation(format!("field '{}' is required", field))
    }
}
