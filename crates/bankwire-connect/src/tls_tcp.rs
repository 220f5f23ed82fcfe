//! Stream binding: length-prefixed frames over mutual TLS on TCP.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::error::{Result, TransportError};
use crate::frame::{encode_message, FrameDecoder};
use crate::message::WireMessage;
use crate::tls::{
    classify_first_read_error, classify_io_error, peer_fingerprint, verdict_follows_handshake, TlsConfig,
    TlsConnector, TlsStream,
};
use crate::transport::{Channel, FrameReader, FrameWriter, Inbound, Transport};

const READ_CHUNK: usize = 8 * 1024;

/// Opens a TCP connection and completes the mutual TLS handshake, both
/// within the endpoint's connect timeout.
pub(crate) async fn open_tls(endpoint: &EndpointConfig) -> Result<TlsStream<TcpStream>> {
    let addr = endpoint.addr();
    let timeout = endpoint.connect_timeout();
    let timed_out = || TransportError::ConnectTimeout {
        addr: addr.clone(),
        timeout_ms: endpoint.connect_timeout_ms,
    };

    let connector = TlsConnector::new(&TlsConfig::from_endpoint(endpoint))?;

    let handshake = async {
        let tcp = TcpStream::connect(&addr).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::ConnectRefused { addr: addr.clone() },
            _ => TransportError::Io(e),
        })?;
        tcp.set_nodelay(true)?;
        connector.connect(endpoint.tls_server_name(), tcp).await
    };

    let stream = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| timed_out())??;

    match peer_fingerprint(&stream) {
        Some(fingerprint) => debug!(bank = %endpoint.name, addr = %addr, fingerprint, "bank certificate accepted"),
        None => debug!(bank = %endpoint.name, addr = %addr, "TLS session established"),
    }
    Ok(stream)
}

/// Waits up to `window` for the bank to refuse our certificate.
///
/// Silence means the bank kept the session. Bytes the bank sends first are
/// returned so the framer sees them.
pub(crate) async fn await_verdict<IO>(stream: &mut TlsStream<IO>, window: Duration) -> Result<Vec<u8>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    if window.is_zero() || !verdict_follows_handshake(stream) {
        return Ok(Vec::new());
    }
    let mut early = vec![0u8; READ_CHUNK];
    match tokio::time::timeout(window, stream.read(&mut early)).await {
        Err(_) => Ok(Vec::new()),
        Ok(Ok(0)) => Err(TransportError::Closed),
        Ok(Ok(n)) => {
            early.truncate(n);
            Ok(early)
        }
        Ok(Err(e)) => Err(classify_first_read_error(e)),
    }
}

/// Stream-binding transport.
#[derive(Debug, Clone, Default)]
pub struct StreamTransport;

impl StreamTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Channel> {
        let mut stream = open_tls(endpoint).await?;
        let early = await_verdict(&mut stream, endpoint.handshake_confirm()).await?;
        debug!(bank = %endpoint.name, addr = %endpoint.addr(), early_bytes = early.len(), "stream channel open");
        Ok(framed_channel_after(stream, endpoint.addr(), &early))
    }

    fn name(&self) -> &'static str {
        "stream"
    }
}

/// Splits any byte stream into a framed [`Channel`]. Also used on the bank
/// side by simulators.
pub fn framed_channel<S>(stream: S, peer: impl Into<String>) -> Channel
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    framed_channel_after(stream, peer, &[])
}

/// Like [`framed_channel`], for a stream from which `early` bytes were
/// already read.
pub fn framed_channel_after<S>(stream: S, peer: impl Into<String>, early: &[u8]) -> Channel
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let mut reader = StreamReader::new(read);
    if !early.is_empty() {
        reader.decoder.extend(early);
        reader.heard_from_peer = true;
    }
    Channel {
        writer: Box::new(StreamWriter::new(write)),
        reader: Box::new(reader),
        peer: peer.into(),
    }
}

/// Read half of a framed byte stream.
pub struct StreamReader<R> {
    io: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
    heard_from_peer: bool,
}

impl<R> StreamReader<R> {
    /// Wraps a read half.
    pub fn new(io: R) -> Self {
        Self {
            io,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
            heard_from_peer: false,
        }
    }
}

#[async_trait]
impl<S> FrameReader for StreamReader<ReadHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn read_message(&mut self) -> Result<Option<Inbound>> {
        loop {
            if let Some(decoded) = self.decoder.next_message() {
                return Ok(Some(match decoded {
                    Ok(msg) => Inbound::Message(msg),
                    Err(e) => Inbound::Malformed(e.to_string()),
                }));
            }
            let read = self.io.read(&mut self.chunk).await;
            let n = match read {
                Ok(n) => n,
                Err(e) if self.heard_from_peer => return Err(classify_io_error(e)),
                Err(e) => return Err(classify_first_read_error(e)),
            };
            self.heard_from_peer = true;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    warn!(buffered = self.decoder.buffered(), "stream closed mid-frame");
                }
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

/// Write half of a framed byte stream.
pub struct StreamWriter<W> {
    io: W,
}

impl<W> StreamWriter<W> {
    /// Wraps a write half.
    pub fn new(io: W) -> Self {
        Self { io }
    }
}

#[async_trait]
impl<S> FrameWriter for StreamWriter<WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn write_message(&mut self, msg: &WireMessage) -> Result<()> {
        let frame = encode_message(msg)?;
        self.io.write_all(&frame).await.map_err(classify_io_error)?;
        self.io.flush().await.map_err(classify_io_error)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
