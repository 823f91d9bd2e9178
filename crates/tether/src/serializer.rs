//! Pluggable payload serializer.
//!
//! Every value embedded in an operation payload goes through the channel's
//! serializer, chosen at construction. The default is JSON; swapping in a
//! binary format changes nothing about the frame layout because embedded
//! values are length-prefixed.

use serde_json::Value;

/// Encode/decode contract for embedded payload values.
///
/// Implementations must be identical on both ends of a channel.
pub trait Serializer: Send + Sync + 'static {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializerError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializerError>;
}

/// A value the serializer could not represent or reconstruct.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SerializerError {
    message: String,
}

impl SerializerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Default serializer: serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|e| SerializerError::new(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializerError> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::new(e.to_string()))
    }
}
