//! Length-prefixed framing for the stream binding.
//!
//! Each frame is a 2-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. Reads off a byte stream do not line up with frames: one frame
//! may arrive split over several reads and one read may carry several
//! frames, so the decoder accumulates bytes and carves out complete frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::message::WireMessage;

/// Size of the length header in bytes.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Largest body a 2-byte length header can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Prefixes `body` with its big-endian length.
pub fn encode_body(body: &[u8]) -> Result<Bytes> {
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Serializes `msg` to JSON and frames it.
pub fn encode_message(msg: &WireMessage) -> Result<Bytes> {
    encode_body(&msg.to_json()?)
}

/// Incremental decoder over a growable receive buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Removes and returns the next complete frame body, if the buffer holds
    /// one. Any remainder stays buffered for the next call.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < LENGTH_PREFIX_LEN + len {
            return None;
        }
        self.buf.advance(LENGTH_PREFIX_LEN);
        Some(self.buf.split_to(len).freeze())
    }

    /// Removes and decodes the next complete frame. A frame whose body is
    /// not a valid envelope is consumed and reported as `MalformedFrame`.
    pub fn next_message(&mut self) -> Option<Result<WireMessage>> {
        self.next_frame().map(|body| WireMessage::from_json(&body))
    }

    /// Number of bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
