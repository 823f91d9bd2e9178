//! Framed codec for the channel byte streams.
//!
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, child stdio) via
//! `FramedRead`/`FramedWrite`.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::operation::OpKind;

/// Upper bound on a single payload; a corrupted length word must not make
/// the acceptor allocate gigabytes.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// One wire frame: an operation tag, the sender-assigned sequence number and
/// the operation's encoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: OpKind,
    pub sequence: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: OpKind, sequence: u64, payload: Bytes) -> Self {
        Self {
            kind,
            sequence,
            payload,
        }
    }
}

/// Encoder/decoder for [`Frame`]s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let tag_len = u16::from_be_bytes([src[0], src[1]]) as usize;
        let header_len = 2 + tag_len + 8 + 4;
        if src.len() < header_len {
            return Ok(None);
        }

        let tag = std::str::from_utf8(&src[2..2 + tag_len])
            .map_err(|_| invalid("frame tag is not valid UTF-8".to_string()))?;
        let kind = OpKind::from_tag(tag)
            .ok_or_else(|| invalid(format!("unknown operation tag '{tag}'")))?;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[2 + tag_len + 8..header_len]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(invalid(format!(
                "frame payload length {payload_len} exceeds the {MAX_PAYLOAD_LEN} byte limit"
            )));
        }

        let frame_len = header_len + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(2 + tag_len);
        let sequence = frame.get_u64();
        frame.advance(4);

        Ok(Some(Frame::new(kind, sequence, frame.freeze())))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let tag = frame.kind.tag();
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(invalid(format!(
                "refusing to encode a {} byte payload",
                frame.payload.len()
            )));
        }

        tracing::trace!(
            tag,
            sequence = frame.sequence,
            payload_len = frame.payload.len(),
            "Encoding frame"
        );

        dst.reserve(2 + tag.len() + 8 + 4 + frame.payload.len());
        dst.put_u16(tag.len() as u16);
        dst.put_slice(tag.as_bytes());
        dst.put_u64(frame.sequence);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn roundtrip() {
        let frame = Frame::new(OpKind::Call, 7, Bytes::from_static(b"payload"));
        let mut buf = encode(frame.clone());
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn wire_layout_is_exact() {
        let buf = encode(Frame::new(OpKind::Event, 1, Bytes::from_static(b"ab")));
        // [5]["EVENT"][seq=1][len=2]["ab"]
        let mut expected = vec![0x00, 0x05];
        expected.extend_from_slice(b"EVENT");
        expected.extend_from_slice(&1u64.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"ab");
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn partial_input_yields_none() {
        let full = encode(Frame::new(OpKind::Response, 42, Bytes::from_static(b"xyz")));
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; only the final byte completes a frame.
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none(), "frame decoded early at byte {i}");
            } else {
                let frame = decoded.unwrap();
                assert_eq!(frame.sequence, 42);
                assert_eq!(&frame.payload[..], b"xyz");
            }
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = encode(Frame::new(OpKind::Call, 1, Bytes::from_static(b"a")));
        buf.extend_from_slice(&encode(Frame::new(OpKind::Response, 2, Bytes::new())));
        let mut codec = FrameCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.kind, OpKind::Call);
        assert_eq!(second.kind, OpKind::Response);
        assert_eq!(second.sequence, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(4);
        buf.put_slice(b"BOGU");
        buf.put_u64(0);
        buf.put_u32(0);
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_length_word_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(8);
        buf.put_slice(b"CALLABLE");
        buf.put_u64(0);
        buf.put_u32(u32::MAX);
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
