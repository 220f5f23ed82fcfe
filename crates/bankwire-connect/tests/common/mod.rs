#![allow(dead_code)]

use bankwire_connect::tls::{generate_self_signed_ca, generate_signed_cert, TlsAcceptor, TlsConfig};
use bankwire_connect::tls_tcp::framed_channel;
use bankwire_connect::transport::{Channel, Inbound};
use bankwire_connect::websocket::message_channel;
use bankwire_connect::{Binding, EndpointConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A throwaway CA that issues both bank and client certificates.
pub struct Pki {
    pub ca: Vec<u8>,
    ca_key: Vec<u8>,
}

impl Pki {
    pub fn new() -> Self {
        let (ca, ca_key) = generate_self_signed_ca().unwrap();
        Self { ca, ca_key }
    }

    pub fn issue(&self, name: &str) -> (Vec<u8>, Vec<u8>) {
        generate_signed_cert(&self.ca, &self.ca_key, name).unwrap()
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let (cert, key) = self.issue("localhost");
        TlsAcceptor::new(&TlsConfig::new(self.ca.clone(), cert, key)).unwrap()
    }

    /// Client settings trusting this CA and presenting a certificate it issued.
    pub fn endpoint(&self, name: &str, binding: Binding, port: u16) -> EndpointConfig {
        let (cert, key) = self.issue("platform-client");
        let mut config = EndpointConfig::new(name, "127.0.0.1", port);
        config.binding = binding;
        config.server_name = Some("localhost".to_string());
        config.path = "/bank".to_string();
        config.server_certificate_authority = String::from_utf8(self.ca.clone()).unwrap();
        config.client_certificate = String::from_utf8(cert).unwrap();
        config.client_key = String::from_utf8(key).unwrap();
        config.connect_timeout_ms = 5_000;
        config.handshake_confirm_ms = 200;
        config.message_timeout_ms = 5_000;
        config.heartbeat_interval_ms = 60_000;
        config.reconnect_base_ms = 50;
        config.reconnect_cap_ms = 400;
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankMode {
    /// Answers every request with its own data.
    Echo,
    /// On the first connection, hangs up when the first application request
    /// arrives. Later connections echo.
    HangUpOnFirstRequest,
}

/// A local bank accepting mutual-TLS connections.
pub struct TestBank {
    pub port: u16,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestBank {
    pub async fn start(pki: &Pki, binding: Binding, mode: BankMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = Arc::new(pki.acceptor());
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((tcp, peer)) = listener.accept().await else {
                    return;
                };
                let number = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let channel = match binding {
                        Binding::Stream => framed_channel(tls, peer.to_string()),
                        Binding::Message => match tokio_tungstenite::accept_async(tls).await {
                            Ok(ws) => message_channel(ws, peer.to_string()),
                            Err(_) => return,
                        },
                    };
                    serve(channel, mode, number).await;
                });
            }
        });

        Self { port, accepted, task }
    }

    /// TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for TestBank {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut channel: Channel, mode: BankMode, number: usize) {
    while let Ok(Some(inbound)) = channel.reader.read_message().await {
        let Inbound::Message(msg) = inbound else {
            continue;
        };
        let Some(id) = msg.id.clone() else {
            continue;
        };
        if mode == BankMode::HangUpOnFirstRequest && number == 1 && !msg.is_heartbeat() {
            let _ = channel.writer.close().await;
            return;
        }
        let reply = bankwire_connect::message::WireMessage::response(id, msg.data);
        if channel.writer.write_message(&reply).await.is_err() {
            return;
        }
    }
}
