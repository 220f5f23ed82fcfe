//! Message binding: one JSON envelope per WebSocket message, over the same
//! mutual TLS session the stream binding uses.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::config::EndpointConfig;
use crate::error::{Result, TransportError};
use crate::message::WireMessage;
use crate::tls::{classify_first_read_error, classify_io_error};
use crate::tls_tcp::{await_verdict, open_tls};
use crate::transport::{Channel, FrameReader, FrameWriter, Inbound, Transport};

/// Secure WebSocket transport.
#[derive(Debug, Clone, Default)]
pub struct MessageTransport;

impl MessageTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }
}

/// URL requested during the upgrade.
pub fn endpoint_url(endpoint: &EndpointConfig) -> String {
    format!("wss://{}:{}{}", endpoint.tls_server_name(), endpoint.port, endpoint.path)
}

#[async_trait]
impl Transport for MessageTransport {
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Channel> {
        let mut tls = open_tls(endpoint).await?;
        let early = await_verdict(&mut tls, endpoint.handshake_confirm()).await?;
        if !early.is_empty() {
            return Err(TransportError::WebSocket(format!(
                "bank sent {} bytes before the upgrade",
                early.len()
            )));
        }
        let url = endpoint_url(endpoint);

        let upgrade = tokio_tungstenite::client_async(url.as_str(), tls);
        let (ws, response) = tokio::time::timeout(endpoint.connect_timeout(), upgrade)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: endpoint.addr(),
                timeout_ms: endpoint.connect_timeout_ms,
            })?
            .map_err(map_upgrade_error)?;

        debug!(bank = %endpoint.name, url = %url, status = response.status().as_u16(), "message channel open");
        Ok(message_channel(ws, url))
    }

    fn name(&self) -> &'static str {
        "message"
    }
}

/// Splits an upgraded WebSocket into a [`Channel`]. Also used on the bank
/// side by simulators.
pub fn message_channel<S>(ws: WebSocketStream<S>, peer: impl Into<String>) -> Channel
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = ws.split();
    Channel {
        writer: Box::new(MessageWriter { sink }),
        reader: Box::new(MessageReader { stream }),
        peer: peer.into(),
    }
}

/// The upgrade response is the first thing the bank sends, so a refusal of
/// our certificate surfaces here under TLS 1.3.
fn map_upgrade_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(e) => classify_first_read_error(e),
        other => map_ws_error(other),
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(e) => classify_io_error(e),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => TransportError::Closed,
        other => TransportError::WebSocket(other.to_string()),
    }
}

struct MessageReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameReader for MessageReader<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn read_message(&mut self) -> Result<Option<Inbound>> {
        loop {
            let item = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(map_ws_error(e)),
                Some(Ok(item)) => item,
            };
            let decoded = match item {
                Message::Text(text) => WireMessage::from_json(text.as_bytes()),
                Message::Binary(bytes) => WireMessage::from_json(&bytes),
                Message::Close(frame) => {
                    debug!(?frame, "bank closed message channel");
                    return Ok(None);
                }
                // Control frames are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Ok(Some(match decoded {
                Ok(msg) => Inbound::Message(msg),
                Err(e) => Inbound::Malformed(e.to_string()),
            }));
        }
    }
}

struct MessageWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameWriter for MessageWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn write_message(&mut self, msg: &WireMessage) -> Result<()> {
        let json = msg.to_json()?;
        let text = String::from_utf8(json).map_err(|e| TransportError::Serialization(e.to_string()))?;
        self.sink.send(Message::Text(text)).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.map_err(map_ws_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn pair() -> (Channel, Channel) {
        let (client, server) = tokio::io::duplex(4096);
        let accept = tokio::spawn(async move { tokio_tungstenite::accept_async(server).await.unwrap() });
        let (ws, _) = tokio_tungstenite::client_async("ws://bank.test/", client).await.unwrap();
        let server = accept.await.unwrap();
        (message_channel(ws, "client"), message_channel(server, "bank"))
    }

    #[test]
    fn test_endpoint_url() {
        let mut endpoint = EndpointConfig::new("mc", "10.1.1.1", 443);
        endpoint.server_name = Some("gw.bank.example".into());
        endpoint.path = "/settlement".into();
        assert_eq!(endpoint_url(&endpoint), "wss://gw.bank.example:443/settlement");
    }

    #[test]
    fn test_refusal_during_upgrade_is_certificate_failure() {
        let refused = || {
            tungstenite::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                rustls::Error::AlertReceived(rustls::AlertDescription::DecryptError),
            ))
        };
        assert!(matches!(
            map_upgrade_error(refused()),
            TransportError::CertificateValidationFailed { .. }
        ));
        assert!(matches!(map_ws_error(refused()), TransportError::Io(_)));
    }

    #[tokio::test]
    async fn test_text_envelope_roundtrip() {
        let (mut client, mut bank) = pair().await;
        let msg = WireMessage::request("w-1", json!({"pan": "tokenized"}));
        client.writer.write_message(&msg).await.unwrap();
        assert_eq!(bank.reader.read_message().await.unwrap(), Some(Inbound::Message(msg)));
    }

    #[tokio::test]
    async fn test_close_yields_none() {
        let (mut client, mut bank) = pair().await;
        client.writer.close().await.unwrap();
        assert_eq!(bank.reader.read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_malformed() {
        let (client, server) = tokio::io::duplex(4096);
        let accept = tokio::spawn(async move { tokio_tungstenite::accept_async(server).await.unwrap() });
        let (ws, _) = tokio_tungstenite::client_async("ws://bank.test/", client).await.unwrap();
        let mut raw = accept.await.unwrap();
        let mut channel = message_channel(ws, "client");

        raw.send(Message::Text("nope".into())).await.unwrap();
        assert!(matches!(
            channel.reader.read_message().await.unwrap(),
            Some(Inbound::Malformed(_))
        ));
    }
}
