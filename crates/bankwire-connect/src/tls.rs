//! Mutual TLS for bank channels.
//!
//! The bank authenticates us with our client certificate and we only accept
//! a server certificate issued by the configured CA. Certificate problems on
//! either side are reported as `CertificateValidationFailed` so they are
//! never retried like an ordinary network failure.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{AlertDescription, RootCertStore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::EndpointConfig;
use crate::error::{Result, TransportError};

pub use tokio_rustls::TlsStream;

/// Certificates and key for one side of a mutual TLS session.
#[derive(Clone)]
pub struct TlsConfig {
    /// PEM-encoded CA bundle used to verify the peer.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded certificate chain presented to the peer.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key for `cert_chain_pem`.
    pub private_key_pem: Vec<u8>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_cert_pem_len", &self.ca_cert_pem.len())
            .field("cert_chain_pem_len", &self.cert_chain_pem.len())
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

impl TlsConfig {
    /// Creates a new TLS configuration.
    pub fn new(ca_cert_pem: Vec<u8>, cert_chain_pem: Vec<u8>, private_key_pem: Vec<u8>) -> Self {
        Self {
            ca_cert_pem,
            cert_chain_pem,
            private_key_pem,
        }
    }

    /// Client-side material taken from an endpoint config.
    pub fn from_endpoint(endpoint: &EndpointConfig) -> Self {
        Self::new(
            endpoint.server_certificate_authority.as_bytes().to_vec(),
            endpoint.client_certificate.as_bytes().to_vec(),
            endpoint.client_key.as_bytes().to_vec(),
        )
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(ca_pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs_from_pem(ca_pem)? {
        roots.add(cert).map_err(|e| TransportError::CertificateValidationFailed {
            reason: format!("failed to add CA cert: {}", e),
        })?;
    }
    Ok(roots)
}

/// Client side of a bank channel: presents our certificate and trusts only
/// the configured CA.
#[derive(Clone)]
pub struct TlsConnector {
    connector: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsConnector(mutual)")
    }
}

impl TlsConnector {
    /// Unusable certificate material is a certificate failure, never a
    /// condition to retry.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let chain = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let client = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls {
                reason: format!("unsupported protocol versions: {}", e),
            })?
            .with_root_certificates(root_store(&config.ca_cert_pem)?)
            .with_client_auth_cert(chain, key)
            .map_err(|e| TransportError::CertificateValidationFailed {
                reason: format!("client certificate rejected: {}", e),
            })?;

        Ok(Self {
            connector: Arc::new(client).into(),
        })
    }

    /// Handshakes over `io`, checking the bank's certificate against
    /// `server_name` (a DNS name or an IP literal).
    pub async fn connect<IO>(&self, server_name: &str, io: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = match server_name.parse::<IpAddr>() {
            Ok(ip) => ServerName::from(ip),
            Err(_) => ServerName::try_from(server_name.to_owned()).map_err(|e| {
                TransportError::CertificateValidationFailed {
                    reason: format!("invalid server name {}: {}", server_name, e),
                }
            })?,
        };
        let session = self.connector.connect(name, io).await.map_err(classify_handshake_error)?;
        Ok(TlsStream::Client(session))
    }
}

/// Bank side of a channel, requiring a client certificate from the
/// configured CA. Used by bank simulators and integration tests.
#[derive(Clone)]
pub struct TlsAcceptor {
    acceptor: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsAcceptor(mutual)")
    }
}

impl TlsAcceptor {
    /// Builds an acceptor presenting `cert_chain_pem` and verifying
    /// clients against `ca_cert_pem`.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let chain = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;
        let roots = Arc::new(root_store(&config.ca_cert_pem)?);

        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
            .build()
            .map_err(|e| TransportError::Tls {
                reason: format!("client verifier: {}", e),
            })?;
        let server = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls {
                reason: format!("unsupported protocol versions: {}", e),
            })?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .map_err(|e| TransportError::Tls {
                reason: format!("bank certificate: {}", e),
            })?;

        Ok(Self {
            acceptor: Arc::new(server).into(),
        })
    }

    /// Completes the server side of the handshake over `io`.
    pub async fn accept<IO>(&self, io: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let session = self.acceptor.accept(io).await.map_err(classify_handshake_error)?;
        Ok(TlsStream::Server(session))
    }
}

/// Fingerprint of the leaf certificate the peer presented, if any.
pub fn peer_fingerprint<IO>(stream: &TlsStream<IO>) -> Option<String> {
    let (_, session) = stream.get_ref();
    session
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|leaf| certificate_fingerprint(leaf.as_ref()))
}

/// SHA-256 fingerprint of a DER certificate as lowercase hex.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    Sha256::digest(der).iter().fold(String::with_capacity(64), |mut hex, byte| {
        hex.push_str(&format!("{:02x}", byte));
        hex
    })
}

fn is_certificate_error(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::InvalidCertificate(_)
            | rustls::Error::NoCertificatesPresented
            | rustls::Error::AlertReceived(
                AlertDescription::BadCertificate
                    | AlertDescription::UnsupportedCertificate
                    | AlertDescription::CertificateRevoked
                    | AlertDescription::CertificateExpired
                    | AlertDescription::CertificateUnknown
                    | AlertDescription::UnknownCA
                    | AlertDescription::CertificateRequired
            )
    )
}

/// Fatal alerts a bank sends while it is still deciding whether to accept
/// us. A bank refusing our certificate after a failed signature check
/// answers `DecryptError`; a policy refusal is `AccessDenied` or
/// `HandshakeFailure`.
fn is_handshake_rejection(err: &rustls::Error) -> bool {
    is_certificate_error(err)
        || matches!(
            err,
            rustls::Error::AlertReceived(
                AlertDescription::DecryptError
                    | AlertDescription::HandshakeFailure
                    | AlertDescription::AccessDenied
            )
        )
}

fn rustls_error(err: &std::io::Error) -> Option<&rustls::Error> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>())
}

/// Maps a handshake failure, keeping certificate problems distinct.
pub(crate) fn classify_handshake_error(err: std::io::Error) -> TransportError {
    if rustls_error(&err).is_some_and(is_handshake_rejection) {
        TransportError::CertificateValidationFailed {
            reason: err.to_string(),
        }
    } else {
        TransportError::Tls {
            reason: format!("TLS handshake failed: {}", err),
        }
    }
}

/// Maps a failure on a channel the bank has not yet sent anything over.
/// Under TLS 1.3 the client finishes its handshake before the bank has
/// checked our certificate, so a refusal shows up here.
pub(crate) fn classify_first_read_error(err: std::io::Error) -> TransportError {
    if rustls_error(&err).is_some_and(is_handshake_rejection) {
        TransportError::CertificateValidationFailed {
            reason: err.to_string(),
        }
    } else {
        TransportError::Io(err)
    }
}

/// Maps an I/O failure on an established channel.
pub(crate) fn classify_io_error(err: std::io::Error) -> TransportError {
    if rustls_error(&err).is_some_and(is_certificate_error) {
        TransportError::CertificateValidationFailed {
            reason: err.to_string(),
        }
    } else {
        TransportError::Io(err)
    }
}

/// True when the session negotiated TLS 1.3, where the bank's verdict on
/// our certificate arrives after the client-side handshake completes.
pub fn verdict_follows_handshake<IO>(stream: &TlsStream<IO>) -> bool {
    stream.get_ref().1.protocol_version() == Some(rustls::ProtocolVersion::TLSv1_3)
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::CertificateValidationFailed {
            reason: format!("unreadable certificate PEM: {}", e),
        })?;

    if certs.is_empty() {
        return Err(TransportError::CertificateValidationFailed {
            reason: "no certificates found in PEM".to_string(),
        });
    }

    Ok(certs)
}

/// Loads a private key (PKCS#8, PKCS#1 or SEC1) from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    match rustls_pemfile::private_key(&mut cursor) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(TransportError::CertificateValidationFailed {
            reason: "no private key found in PEM".to_string(),
        }),
        Err(e) => Err(TransportError::CertificateValidationFailed {
            reason: format!("unreadable private key PEM: {}", e),
        }),
    }
}

/// Generates a self-signed CA certificate and key pair.
///
/// Returns (CA certificate PEM, CA key PEM).
pub fn generate_self_signed_ca() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| TransportError::Tls {
        reason: format!("failed to generate CA key: {}", e),
    })?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let cert = params.self_signed(&key_pair).map_err(|e| TransportError::Tls {
        reason: format!("failed to create CA certificate: {}", e),
    })?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Generates a leaf certificate for `subject_name` signed by the given CA.
///
/// Returns (certificate PEM, key PEM).
pub fn generate_signed_cert(
    ca_cert_pem: &[u8],
    ca_key_pem: &[u8],
    subject_name: &str,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let tls_err = |what: &str, e: &dyn fmt::Display| TransportError::Tls {
        reason: format!("{}: {}", what, e),
    };

    let ca_key_str = std::str::from_utf8(ca_key_pem).map_err(|e| tls_err("invalid CA key PEM", &e))?;
    let ca_key = rcgen::KeyPair::from_pem(ca_key_str).map_err(|e| tls_err("failed to parse CA key", &e))?;

    let ca_cert_str =
        std::str::from_utf8(ca_cert_pem).map_err(|e| tls_err("invalid CA cert PEM", &e))?;
    let ca_params = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_str)
        .map_err(|e| tls_err("failed to parse CA certificate", &e))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| tls_err("failed to reconstruct CA certificate", &e))?;

    let key = rcgen::KeyPair::generate().map_err(|e| tls_err("failed to generate key", &e))?;
    let params = rcgen::CertificateParams::new(vec![subject_name.to_string()])
        .map_err(|e| tls_err("failed to create certificate params", &e))?;
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(|e| tls_err("failed to sign certificate", &e))?;

    Ok((cert.pem().into_bytes(), key.serialize_pem().into_bytes()))
}
