//! The operation model: the four tagged wire messages a channel exchanges.
//!
//! Execution lives in the channel dispatcher; this module is the data model
//! and its (de)serialization contract.

use serde_json::Value;
use tokio_util::bytes::Bytes;

use super::wire::{PayloadReader, PayloadWriter};
use crate::error::ChannelError;
use crate::options::StreamName;
use crate::serializer::Serializer;

/// Operation type tags. The tag set must be identical on both ends of a
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Call,
    Task,
    Event,
    Response,
}

impl OpKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Call => "CALLABLE",
            Self::Task => "RUNNABLE",
            Self::Event => "EVENT",
            Self::Response => "RESPONSE",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "CALLABLE" => Some(Self::Call),
            "RUNNABLE" => Some(Self::Task),
            "EVENT" => Some(Self::Event),
            "RESPONSE" => Some(Self::Response),
            _ => None,
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// One wire-level unit of work.
///
/// Immutable once constructed; the completion handle observing a call's
/// outcome lives in the pending table, not here.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// A named remote call expecting a typed result.
    Call {
        name: String,
        args: Value,
        response_required: bool,
    },

    /// Fire-and-forget flavor of a call; `()` result.
    Task {
        name: String,
        args: Value,
        response_required: bool,
    },

    /// An event published to the listeners of `stream` on the receiving
    /// side. The stream name is the ordering key.
    Event {
        stream: StreamName,
        payload: Value,
        response_required: bool,
    },

    /// The outcome of an acknowledged operation, correlated purely by the
    /// frame's sequence number. Never acknowledged itself.
    Response { result: Result<Value, String> },
}

impl Operation {
    pub fn response_ok(value: Value) -> Self {
        Self::Response { result: Ok(value) }
    }

    pub fn response_err(message: impl Into<String>) -> Self {
        Self::Response {
            result: Err(message.into()),
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Self::Call { .. } => OpKind::Call,
            Self::Task { .. } => OpKind::Task,
            Self::Event { .. } => OpKind::Event,
            Self::Response { .. } => OpKind::Response,
        }
    }

    /// The ordering key, present only for events.
    pub fn stream_name(&self) -> Option<&StreamName> {
        match self {
            Self::Event { stream, .. } => Some(stream),
            _ => None,
        }
    }

    pub fn response_required(&self) -> bool {
        match self {
            Self::Call {
                response_required, ..
            }
            | Self::Task {
                response_required, ..
            }
            | Self::Event {
                response_required, ..
            } => *response_required,
            Self::Response { .. } => false,
        }
    }

    /// Serialize the payload portion of this operation. Touches no stream;
    /// the sender only writes a frame once this has succeeded.
    pub fn encode(&self, serializer: &dyn Serializer) -> Result<Bytes, ChannelError> {
        let mut writer = PayloadWriter::new();
        match self {
            Self::Call {
                name,
                args,
                response_required,
            }
            | Self::Task {
                name,
                args,
                response_required,
            } => {
                writer.put_bool(*response_required);
                writer.put_str(name)?;
                writer.put_value(args, serializer)?;
            }
            Self::Event {
                stream,
                payload,
                response_required,
            } => {
                writer.put_str(stream.as_str())?;
                writer.put_bool(*response_required);
                writer.put_value(payload, serializer)?;
            }
            Self::Response { result } => match result {
                Ok(value) => {
                    writer.put_bool(false);
                    writer.put_value(value, serializer)?;
                }
                Err(message) => {
                    writer.put_bool(true);
                    writer.put_str(message)?;
                }
            },
        }
        Ok(writer.finish())
    }

    /// Reconstruct an operation from a frame's tag and payload.
    pub fn decode(
        kind: OpKind,
        payload: Bytes,
        serializer: &dyn Serializer,
    ) -> Result<Self, ChannelError> {
        let mut reader = PayloadReader::new(payload);
        let operation = match kind {
            OpKind::Call => {
                let response_required = reader.get_bool()?;
                let name = reader.get_str()?;
                let args = reader.get_value(serializer)?;
                Self::Call {
                    name,
                    args,
                    response_required,
                }
            }
            OpKind::Task => {
                let response_required = reader.get_bool()?;
                let name = reader.get_str()?;
                let args = reader.get_value(serializer)?;
                Self::Task {
                    name,
                    args,
                    response_required,
                }
            }
            OpKind::Event => {
                let stream = StreamName::of(reader.get_str()?);
                if stream.is_empty() {
                    return Err(ChannelError::deserialize("event frame with empty stream name"));
                }
                let response_required = reader.get_bool()?;
                let payload = reader.get_value(serializer)?;
                Self::Event {
                    stream,
                    payload,
                    response_required,
                }
            }
            OpKind::Response => {
                let is_error = reader.get_bool()?;
                let result = if is_error {
                    Err(reader.get_str()?)
                } else {
                    Ok(reader.get_value(serializer)?)
                };
                Self::Response { result }
            }
        };
        reader.expect_end()?;
        Ok(operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;
    use serde_json::json;

    fn roundtrip(operation: Operation) -> Operation {
        let payload = operation.encode(&JsonSerializer).unwrap();
        Operation::decode(operation.kind(), payload, &JsonSerializer).unwrap()
    }

    #[test]
    fn tags_match_the_shared_registry() {
        for kind in [OpKind::Call, OpKind::Task, OpKind::Event, OpKind::Response] {
            assert_eq!(OpKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(OpKind::Call.tag(), "CALLABLE");
        assert_eq!(OpKind::Task.tag(), "RUNNABLE");
        assert_eq!(OpKind::Event.tag(), "EVENT");
        assert_eq!(OpKind::Response.tag(), "RESPONSE");
        assert!(OpKind::from_tag("PING").is_none());
    }

    #[test]
    fn call_roundtrip() {
        let operation = Operation::Call {
            name: "GetPid".to_string(),
            args: json!({"verbose": true}),
            response_required: true,
        };
        assert_eq!(roundtrip(operation.clone()), operation);
    }

    #[test]
    fn task_roundtrip() {
        let operation = Operation::Task {
            name: "Shutdown".to_string(),
            args: Value::Null,
            response_required: false,
        };
        assert_eq!(roundtrip(operation.clone()), operation);
    }

    #[test]
    fn event_roundtrip() {
        let operation = Operation::Event {
            stream: StreamName::of("logs"),
            payload: json!("hello"),
            response_required: true,
        };
        assert_eq!(roundtrip(operation.clone()), operation);
        assert_eq!(
            roundtrip(operation).stream_name(),
            Some(&StreamName::of("logs"))
        );
    }

    #[test]
    fn response_roundtrips_value_and_error() {
        let ok = Operation::response_ok(json!(42));
        assert_eq!(roundtrip(ok.clone()), ok);
        assert!(!ok.response_required());

        let err = Operation::response_err("it broke");
        assert_eq!(roundtrip(err.clone()), err);
    }

    #[test]
    fn empty_stream_name_is_rejected() {
        let operation = Operation::Event {
            stream: StreamName::of(""),
            payload: Value::Null,
            response_required: false,
        };
        let payload = operation.encode(&JsonSerializer).unwrap();
        let err = Operation::decode(OpKind::Event, payload, &JsonSerializer).unwrap_err();
        assert!(matches!(err, ChannelError::Deserialize { .. }));
    }

    #[test]
    fn only_events_carry_a_stream_name() {
        let call = Operation::Call {
            name: "x".into(),
            args: Value::Null,
            response_required: true,
        };
        assert!(call.stream_name().is_none());
        assert!(Operation::response_ok(Value::Null).stream_name().is_none());
    }
}
