//! Error types for the signaling core

use std::fmt::Display;
use thiserror::Error;

use crate::engine::EngineError;
use crate::types::ProducerId;

/// Signaling core error types
#[derive(Debug, Error)]
pub enum SfuError {
    /// A peer, transport, producer or consumer referenced by id is not registered
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The receiver's capabilities cannot carry the producer's media
    #[error("producer {0} cannot be consumed with the given capabilities")]
    Incompatible(ProducerId),

    /// The media engine rejected or failed a capability call
    #[error("media engine error: {0}")]
    Engine(#[from] EngineError),

    /// Malformed or semantically invalid inbound message
    #[error("protocol fault: {0}")]
    Protocol(String),

    #[error("capacity reached: {0}")]
    Capacity(String),
}

impl SfuError {
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// Result type for signaling operations
pub type Result<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SfuError::not_found("producer", "p1");
        assert_eq!(err.to_string(), "producer not found: p1");

        let err = SfuError::from(EngineError::Internal("worker died".to_string()));
        assert_eq!(err.to_string(), "media engine error: engine failure: worker died");
    }
}
