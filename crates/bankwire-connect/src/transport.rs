//! Abstract transport contract for bank channels.
//!
//! A [`Transport`] opens a secure channel to one endpoint and hands back its
//! two halves: a [`FrameWriter`] that puts one envelope on the wire and a
//! [`FrameReader`] that yields decoded envelopes. The stream binding
//! (length-prefixed mTLS) and the message binding (secure WebSocket) both
//! implement it, so correlation, heartbeats and reconnection are written
//! once against this interface.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{Binding, EndpointConfig};
use crate::error::Result;
use crate::message::WireMessage;
use crate::tls_tcp::StreamTransport;
use crate::websocket::MessageTransport;

/// One item read off a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A well-formed envelope.
    Message(WireMessage),
    /// A frame that arrived intact but could not be decoded. It has been
    /// consumed; the channel remains usable.
    Malformed(String),
}

/// Write half of an open channel.
#[async_trait]
pub trait FrameWriter: Send {
    /// Encodes and writes one envelope.
    ///
    /// Encoding failures (`FrameTooLarge`, `Serialization`) leave the
    /// channel intact; any other error means the channel is gone.
    async fn write_message(&mut self, msg: &WireMessage) -> Result<()>;

    /// Closes the channel gracefully.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of an open channel.
#[async_trait]
pub trait FrameReader: Send {
    /// Returns the next inbound item, or `None` once the peer closed the
    /// channel cleanly.
    async fn read_message(&mut self) -> Result<Option<Inbound>>;
}

/// A freshly opened channel.
pub struct Channel {
    /// Write half.
    pub writer: Box<dyn FrameWriter>,
    /// Read half.
    pub reader: Box<dyn FrameReader>,
    /// Human-readable peer description for logs and events.
    pub peer: String,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("peer", &self.peer).finish()
    }
}

/// Opens channels to a bank endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a channel. Certificate failures must be reported as
    /// `CertificateValidationFailed`, never folded into a generic error.
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Channel>;

    /// Short binding name for logs.
    fn name(&self) -> &'static str;
}

/// Returns the transport implementing `binding`.
pub fn for_binding(binding: Binding) -> Arc<dyn Transport> {
    match binding {
        Binding::Stream => Arc::new(StreamTransport::new()),
        Binding::Message => Arc::new(MessageTransport::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_dispatch() {
        assert_eq!(for_binding(Binding::Stream).name(), "stream");
        assert_eq!(for_binding(Binding::Message).name(), "message");
    }
}
