//! Registry of connections keyed by bank network name.

use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::{EndpointConfig, NetworksConfig};
use crate::connection::BankConnection;
use crate::error::{ConfigError, ConnectError, TransportError};

/// One [`BankConnection`] per named bank network. Connections share no
/// state with each other.
#[derive(Debug, Default)]
pub struct BankNetworks {
    connections: HashMap<String, BankConnection>,
}

impl BankNetworks {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds disconnected connections for every configured bank.
    pub fn from_config(config: &NetworksConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut networks = Self::new();
        for bank in &config.banks {
            networks.insert(BankConnection::new(bank.clone()))?;
        }
        Ok(networks)
    }

    /// Adds a connection. Names must be unique.
    pub fn insert(&mut self, connection: BankConnection) -> Result<(), ConfigError> {
        let name = connection.name().to_string();
        if self.connections.contains_key(&name) {
            return Err(ConfigError::DuplicateBank(name));
        }
        self.connections.insert(name, connection);
        Ok(())
    }

    /// Adds a connection for `config` using its configured binding.
    pub fn add_endpoint(&mut self, config: EndpointConfig) -> Result<BankConnection, ConfigError> {
        config.validate()?;
        let connection = BankConnection::new(config);
        self.insert(connection.clone())?;
        Ok(connection)
    }

    /// Connection for bank `name`.
    pub fn get(&self, name: &str) -> Option<&BankConnection> {
        self.connections.get(name)
    }

    /// Removes a connection without disconnecting it.
    pub fn remove(&mut self, name: &str) -> Option<BankConnection> {
        self.connections.remove(name)
    }

    /// Sorted bank names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of banks.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when no bank is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connects every bank concurrently and reports each outcome.
    pub async fn connect_all(&self) -> Vec<(String, Result<(), ConnectError>)> {
        let attempts = self.connections.iter().map(|(name, conn)| async move {
            let result = conn.connect().await;
            if let Err(e) = &result {
                warn!(bank = %name, error = %e, "bank connect failed");
            }
            (name.clone(), result)
        });
        let mut results = futures_util::future::join_all(attempts).await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        info!(
            banks = results.len(),
            connected = results.iter().filter(|(_, r)| r.is_ok()).count(),
            "connect_all finished"
        );
        results
    }

    /// Disconnects every bank.
    pub async fn disconnect_all(&self) -> Vec<(String, Result<(), TransportError>)> {
        let closes = self
            .connections
            .iter()
            .map(|(name, conn)| async move { (name.clone(), conn.disconnect().await) });
        let mut results = futures_util::future::join_all(closes).await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Binding;
    use crate::sim::{SimOpen, SimTransport};
    use std::sync::Arc;

    fn sim_connection(name: &str, sim: &SimTransport) -> BankConnection {
        BankConnection::with_transport(EndpointConfig::new(name, "sim.bank", 1), Arc::new(sim.clone()))
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut networks = BankNetworks::new();
        let sim = SimTransport::new();
        networks.insert(sim_connection("visa", &sim)).unwrap();
        assert!(matches!(
            networks.insert(sim_connection("visa", &sim)),
            Err(ConfigError::DuplicateBank(_))
        ));
        assert_eq!(networks.len(), 1);
    }

    #[test]
    fn test_from_config() {
        let mut mc = EndpointConfig::new("mastercard", "mc.example", 443);
        mc.binding = Binding::Message;
        let config = NetworksConfig {
            banks: vec![EndpointConfig::new("visa", "visa.example", 7000), mc],
        };
        let networks = BankNetworks::from_config(&config).unwrap();
        assert_eq!(networks.names(), vec!["mastercard".to_string(), "visa".to_string()]);
        assert_eq!(networks.get("visa").unwrap().config().port, 7000);
        assert!(networks.get("amex").is_none());
    }

    #[test]
    fn test_add_endpoint_validates() {
        let mut networks = BankNetworks::new();
        assert!(networks.add_endpoint(EndpointConfig::new("bad", "host", 0)).is_err());
        assert!(networks.is_empty());
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_all() {
        let visa = SimTransport::new();
        let amex = SimTransport::new();
        amex.script([SimOpen::RejectCertificate]);

        let mut networks = BankNetworks::new();
        networks.insert(sim_connection("visa", &visa)).unwrap();
        networks.insert(sim_connection("amex", &amex)).unwrap();

        let results = networks.connect_all().await;
        assert_eq!(results[0].0, "amex");
        assert!(matches!(results[0].1, Err(ConnectError::CertificateValidationFailed { .. })));
        assert_eq!(results[1].0, "visa");
        assert!(results[1].1.is_ok());
        assert!(networks.get("visa").unwrap().is_connected());

        let closed = networks.disconnect_all().await;
        assert!(closed.iter().all(|(_, r)| r.is_ok()));
        assert!(!networks.get("visa").unwrap().is_connected());

        let removed = networks.remove("visa").unwrap();
        assert_eq!(removed.name(), "visa");
        assert_eq!(networks.names(), vec!["amex".to_string()]);
    }
}
