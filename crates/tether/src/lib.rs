//! tether: an asynchronous control channel for driving a spawned runtime.
//!
//! A [`Channel`] is built over a pair of byte streams connecting two
//! processes and provides a bidirectional remote-call/event protocol on top
//! of them: calls and fire-and-forget tasks are correlated with their
//! responses by sequence number, events are delivered in order per stream
//! name, and the whole thing degrades to a well-defined closed state when
//! either side goes away.
//!
//! Transport establishment (sockets, pipes, child process spawning) is the
//! caller's problem; the channel only ever sees the two stream halves it is
//! handed at construction.

mod cache;
mod channel;
mod error;
mod listener;
mod options;
mod pending;
pub mod protocol;
mod registry;
mod serializer;

pub use channel::{Channel, ChannelContext, Reply};
pub use error::ChannelError;
pub use listener::{ChannelListener, EventListener};
pub use options::{AckMode, Caching, StreamName, SubmitOptions};
pub use registry::{Protocol, RemoteCall, RemoteTask};
pub use serializer::{JsonSerializer, Serializer, SerializerError};
