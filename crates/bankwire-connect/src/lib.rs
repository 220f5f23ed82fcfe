#![warn(missing_docs)]

//! Bankwire connection engine: persistent mutual-TLS channels to bank endpoints with request correlation, heartbeats and bounded reconnection

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod message;
pub mod networks;
pub mod registry;
pub mod sim;
pub mod tls;
pub mod tls_tcp;
pub mod transport;
pub mod websocket;

pub use config::{Binding, EndpointConfig, NetworksConfig};
pub use connection::{BankConnection, ConnectionEvent, ConnectionState};
pub use error::{ConfigError, ConnectError, SendError, TransportError};
pub use networks::BankNetworks;
