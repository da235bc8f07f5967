use thiserror::Error;

/// Error type for encoding and decoding events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The discriminator is not in the registry. Never decoded as a default.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    /// Malformed bytes, a broken frame, or a payload not matching its schema.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Serialization(err.to_string())
    }
}
