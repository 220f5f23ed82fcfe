//! Per-endpoint configuration and config-file loading.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

/// Which transport binding an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// Mutual-TLS byte stream with 2-byte length-prefixed frames.
    #[default]
    Stream,
    /// Secure WebSocket, one envelope per message.
    Message,
}

/// Settings for one bank endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Bank network name, used in logs and as the registry key.
    pub name: String,
    /// Transport binding the bank speaks.
    pub binding: Binding,
    /// Bank host name or address.
    pub host: String,
    /// Bank port.
    pub port: u16,
    /// Name checked against the bank's certificate. Defaults to `host`.
    pub server_name: Option<String>,
    /// Request path for the message binding.
    pub path: String,
    /// PEM client certificate chain presented to the bank.
    pub client_certificate: String,
    /// PEM client private key.
    pub client_key: String,
    /// PEM CA bundle that must have issued the bank's certificate.
    pub server_certificate_authority: String,
    /// Bound on TCP connect, TLS handshake and WebSocket upgrade together.
    pub connect_timeout_ms: u64,
    /// How long the bank may sit on our certificate after a TLS 1.3
    /// handshake before the stream channel is handed out. 0 skips the wait.
    pub handshake_confirm_ms: u64,
    /// Default deadline for one request.
    pub message_timeout_ms: u64,
    /// Period between heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Delay before the first reconnection attempt.
    pub reconnect_base_ms: u64,
    /// Upper bound for any reconnection delay.
    pub reconnect_cap_ms: u64,
    /// Reconnection attempts allowed before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            binding: Binding::Stream,
            host: String::from("127.0.0.1"),
            port: 0,
            server_name: None,
            path: String::from("/"),
            client_certificate: String::new(),
            client_key: String::new(),
            server_certificate_authority: String::new(),
            connect_timeout_ms: 10_000,
            handshake_confirm_ms: 500,
            message_timeout_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 60_000,
            max_reconnect_attempts: 3,
        }
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("name", &self.name)
            .field("binding", &self.binding)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("server_name", &self.server_name)
            .field("path", &self.path)
            .field("client_key", &"<redacted>")
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("handshake_confirm_ms", &self.handshake_confirm_ms)
            .field("message_timeout_ms", &self.message_timeout_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("reconnect_base_ms", &self.reconnect_base_ms)
            .field("reconnect_cap_ms", &self.reconnect_cap_ms)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

impl EndpointConfig {
    /// Creates a config for `name` at `host:port` with default timings.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// `host:port` string used for the TCP connect.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Name the bank's certificate is verified against.
    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    /// `connect_timeout_ms` as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `handshake_confirm_ms`, capped by the connect timeout.
    pub fn handshake_confirm(&self) -> Duration {
        Duration::from_millis(self.handshake_confirm_ms.min(self.connect_timeout_ms))
    }

    /// `message_timeout_ms` as a duration.
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// `heartbeat_interval_ms` as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Backoff policy derived from the reconnect settings.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_cap_ms),
            self.max_reconnect_attempts,
        )
    }

    /// Checks that the settings describe a usable endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(invalid("name", "must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(invalid("host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port", "must be non-zero"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms", "must be non-zero"));
        }
        if self.message_timeout_ms == 0 {
            return Err(invalid("message_timeout_ms", "must be non-zero"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms", "must be non-zero"));
        }
        if self.reconnect_base_ms > self.reconnect_cap_ms {
            return Err(invalid(
                "reconnect_base_ms",
                format!(
                    "{} exceeds reconnect_cap_ms {}",
                    self.reconnect_base_ms, self.reconnect_cap_ms
                ),
            ));
        }
        if self.binding == Binding::Message && !self.path.starts_with('/') {
            return Err(invalid("path", "must start with '/'"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// A set of bank endpoints, as stored in a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworksConfig {
    /// One entry per bank network.
    #[serde(default)]
    pub banks: Vec<EndpointConfig>,
}

impl NetworksConfig {
    /// Loads a `.toml` or `.json` file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NetworksConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            _ => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates every endpoint and rejects duplicate names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for bank in &self.banks {
            bank.validate()?;
            if !seen.insert(bank.name.as_str()) {
                return Err(ConfigError::DuplicateBank(bank.name.clone()));
            }
        }
        Ok(())
    }

    /// Looks up an endpoint by bank name.
    pub fn bank(&self, name: &str) -> Option<&EndpointConfig> {
        self.banks.iter().find(|b| b.name == name)
    }
}
