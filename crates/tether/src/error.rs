//! Channel error taxonomy.
//!
//! Only transport failure is fatal to a channel; every other error is
//! contained to the single operation involved.

/// Errors surfaced by channel submissions and replies.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel is not open (never opened, or already closed).
    #[error("channel is closed")]
    Closed,

    /// The submitted call or task is not part of the channel protocol and
    /// could not be reconstructed on the remote side.
    #[error("'{name}' is not registered with the channel protocol")]
    Unregistered { name: String },

    /// Events require a non-empty stream name.
    #[error("stream name can't be empty")]
    InvalidStreamName,

    /// The operation payload could not be serialized. The live output
    /// stream is never touched when this happens.
    #[error("failed to serialize operation: {message}")]
    Serialize { message: String },

    /// An inbound payload or a reply value could not be decoded.
    #[error("failed to decode payload: {message}")]
    Deserialize { message: String },

    /// The remote side executed the operation and reported a failure.
    #[error("remote execution failed: {message}")]
    Remote { message: String },

    /// Reading or writing the underlying streams failed.
    #[error("channel i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub fn serialize(message: impl Into<String>) -> Self {
        Self::Serialize {
            message: message.into(),
        }
    }

    pub fn deserialize(message: impl Into<String>) -> Self {
        Self::Deserialize {
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub fn unregistered(name: impl Into<String>) -> Self {
        Self::Unregistered { name: name.into() }
    }
}
