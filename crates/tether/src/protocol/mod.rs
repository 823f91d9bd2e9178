//! Wire-level concerns: the frame codec, payload composition helpers and the
//! operation model.
//!
//! Frame layout: `[tag: u16 length-prefixed UTF-8][sequence: u64][payload
//! length: u32][payload bytes]`, all integers big-endian. The payload is
//! composed by the operation's own encode contract; embedded values are
//! length-prefixed output of the channel's serializer.

pub mod frame;
pub mod operation;
pub mod wire;

pub use frame::{Frame, FrameCodec, MAX_PAYLOAD_LEN};
pub use operation::{OpKind, Operation};
