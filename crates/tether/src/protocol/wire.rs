//! Payload composition helpers.
//!
//! Operations build their payloads out of primitives (booleans, short
//! strings) plus embedded values produced by the channel serializer. Strings
//! are u16 length-prefixed UTF-8; embedded values are u32 length-prefixed
//! serializer output.

use serde_json::Value;
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ChannelError;
use crate::serializer::Serializer;

#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn put_str(&mut self, value: &str) -> Result<(), ChannelError> {
        if value.len() > u16::MAX as usize {
            return Err(ChannelError::serialize(format!(
                "string of {} bytes exceeds the u16 length prefix",
                value.len()
            )));
        }
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn put_value(
        &mut self,
        value: &Value,
        serializer: &dyn Serializer,
    ) -> Result<(), ChannelError> {
        let bytes = serializer
            .serialize(value)
            .map_err(|e| ChannelError::serialize(e.to_string()))?;
        if bytes.len() > u32::MAX as usize {
            return Err(ChannelError::serialize(format!(
                "value of {} bytes exceeds the u32 length prefix",
                bytes.len()
            )));
        }
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(&bytes);
        Ok(())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Debug)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, len: usize) -> Result<(), ChannelError> {
        if self.buf.len() < len {
            return Err(ChannelError::deserialize(format!(
                "truncated payload: needed {len} more bytes, have {}",
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn get_bool(&mut self) -> Result<bool, ChannelError> {
        self.need(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ChannelError::deserialize(format!(
                "invalid boolean byte {other:#04x}"
            ))),
        }
    }

    pub fn get_str(&mut self) -> Result<String, ChannelError> {
        self.need(2)?;
        let len = self.buf.get_u16() as usize;
        self.need(len)?;
        let bytes = self.buf.split_to(len);
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ChannelError::deserialize("string is not valid UTF-8"))
    }

    pub fn get_value(&mut self, serializer: &dyn Serializer) -> Result<Value, ChannelError> {
        self.need(4)?;
        let len = self.buf.get_u32() as usize;
        self.need(len)?;
        let bytes = self.buf.split_to(len);
        serializer
            .deserialize(&bytes)
            .map_err(|e| ChannelError::deserialize(e.to_string()))
    }

    /// Payloads must be consumed exactly; trailing bytes mean the two ends
    /// disagree about the operation layout.
    pub fn expect_end(&self) -> Result<(), ChannelError> {
        if !self.buf.is_empty() {
            return Err(ChannelError::deserialize(format!(
                "{} unexpected trailing bytes",
                self.buf.len()
            )));
        }
        Ok(())
    }
}
