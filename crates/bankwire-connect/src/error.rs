//! Error taxonomy for the bank connection engine.
//!
//! Binding-level failures are reported as [`TransportError`] and translated
//! into [`ConnectError`] (returned by `connect`) or [`SendError`] (the
//! rejection carried by every pending request) before reaching callers.

use thiserror::Error;

/// Failures raised by a transport binding or the framer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing was listening at the bank address.
    #[error("connection refused by {addr}")]
    ConnectRefused {
        /// `host:port` dialled.
        addr: String,
    },

    /// Connect, handshake or upgrade did not finish in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectTimeout {
        /// `host:port` dialled.
        addr: String,
        /// Bound that elapsed.
        timeout_ms: u64,
    },

    /// Either side refused the other's certificate.
    #[error("certificate validation failed: {reason}")]
    CertificateValidationFailed {
        /// rustls' description of the refusal.
        reason: String,
    },

    /// TLS failed for a reason unrelated to certificates.
    #[error("TLS failure: {reason}")]
    Tls {
        /// What went wrong.
        reason: String,
    },

    /// A frame arrived that is not a valid envelope.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// Decoder error.
        reason: String,
    },

    /// An encoded envelope does not fit the 2-byte length prefix.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Encoded body length.
        size: usize,
        /// Largest body a frame can carry.
        max: usize,
    },

    /// The channel was already closed.
    #[error("channel closed")]
    Closed,

    /// An envelope could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true when the error means the channel itself is unusable, as
    /// opposed to a single message that could not be encoded.
    pub fn is_channel_failure(&self) -> bool {
        !matches!(
            self,
            TransportError::FrameTooLarge { .. }
                | TransportError::Serialization(_)
                | TransportError::MalformedFrame { .. }
        )
    }
}

/// Errors returned by `BankConnection::connect`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The bank's certificate (or ours) was rejected. Never retried.
    #[error("certificate validation failed: {reason}")]
    CertificateValidationFailed {
        /// rustls' description of the refusal.
        reason: String,
    },

    /// The last attempt timed out.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectTimeout {
        /// `host:port` dialled.
        addr: String,
        /// Bound that elapsed.
        timeout_ms: u64,
    },

    /// The last attempt was refused.
    #[error("connection refused by {addr}")]
    ConnectRefused {
        /// `host:port` dialled.
        addr: String,
    },

    /// Any other open failure (I/O, handshake interrupted, websocket upgrade).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The retry budget is spent; the connection stays disconnected until
    /// `connect` is called again.
    #[error("reconnection exhausted after {attempts} attempts: {last_error}")]
    ReconnectionExhausted {
        /// Retries made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: String,
    },

    /// The attempt was superseded by `disconnect`.
    #[error("connect cancelled")]
    Cancelled,

    /// Another connect, reconnection or disconnect is in progress.
    #[error("cannot connect while {state}")]
    InvalidState {
        /// State the connection was in.
        state: String,
    },
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::CertificateValidationFailed { reason } => {
                ConnectError::CertificateValidationFailed { reason }
            }
            TransportError::ConnectTimeout { addr, timeout_ms } => {
                ConnectError::ConnectTimeout { addr, timeout_ms }
            }
            TransportError::ConnectRefused { addr } => ConnectError::ConnectRefused { addr },
            other => ConnectError::Transport(other.to_string()),
        }
    }
}

/// Rejection reason for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No response arrived before the request deadline.
    #[error("request {id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Correlation id of the request.
        id: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The channel dropped while the request was outstanding.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Why the channel went away.
        reason: String,
    },

    /// The connection was explicitly disconnected.
    #[error("request cancelled by disconnect")]
    Cancelled,

    /// `send` was called without an open channel.
    #[error("not connected")]
    NotConnected,

    /// The request does not fit in one frame. The channel stays up.
    #[error("request too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Encoded body length.
        size: usize,
        /// Largest body a frame can carry.
        max: usize,
    },

    /// The payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The correlation id is already in use.
    #[error("correlation id {0} already outstanding")]
    DuplicateId(String),
}

impl SendError {
    /// True when the failure concerns the whole channel rather than this
    /// one request.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            SendError::ConnectionLost { .. } | SendError::Cancelled | SendError::NotConnected
        )
    }
}

impl From<TransportError> for SendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::FrameTooLarge { size, max } => SendError::FrameTooLarge { size, max },
            TransportError::Serialization(reason) => SendError::Serialization(reason),
            other => SendError::ConnectionLost {
                reason: other.to_string(),
            },
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML or JSON for this schema.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// Neither `.toml` nor `.json`.
    #[error("unsupported config file extension: {0}")]
    UnsupportedFormat(String),

    /// A setting is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Two endpoints share a name.
    #[error("bank {0} is configured more than once")]
    DuplicateBank(String),
}

/// Result alias for transport-level operations.
pub type Result<T> = std::result::Result<T, TransportError>;
