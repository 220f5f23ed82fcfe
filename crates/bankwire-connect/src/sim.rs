//! Simulated bank endpoint for exercising connections without a network.
//!
//! [`SimTransport`] implements [`Transport`] entirely in memory. Open
//! outcomes can be scripted, the bank's reply behaviour changed on the fly,
//! and the live link severed or fed arbitrary frames, so lifecycle paths
//! can be driven deterministically under a paused clock.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::EndpointConfig;
use crate::error::{Result, TransportError};
use crate::frame::encode_message;
use crate::message::WireMessage;
use crate::transport::{Channel, FrameReader, FrameWriter, Inbound, Transport};

/// Outcome of one scripted open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOpen {
    /// Opens a live link.
    Accept,
    /// Fails at once with `ConnectRefused`.
    Refuse,
    /// Hangs for the connect timeout, then fails.
    Timeout,
    /// Fails with `CertificateValidationFailed`.
    RejectCertificate,
}

/// How the simulated bank answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BankBehavior {
    /// Returns every request's data under the same id.
    #[default]
    Echo,
    /// Never answers.
    Silent,
    /// Answers application requests but ignores heartbeats.
    EchoExceptHeartbeat,
}

enum SimFrame {
    Message(WireMessage),
    Malformed(String),
    Close,
    Reset,
    RejectCertificate,
}

struct SimLink {
    to_client: mpsc::UnboundedSender<SimFrame>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct SimState {
    script: VecDeque<SimOpen>,
    behavior: BankBehavior,
    attempts: Vec<Instant>,
    received: Vec<WireMessage>,
    link: Option<SimLink>,
}

/// In-memory transport standing in for a bank.
#[derive(Clone, Default)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimTransport")
            .field("behavior", &state.behavior)
            .field("scripted", &state.script.len())
            .field("attempts", &state.attempts.len())
            .field("linked", &state.link.is_some())
            .finish()
    }
}

impl SimTransport {
    /// A bank that accepts every open and echoes requests.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues outcomes for the next opens. Opens beyond the script succeed.
    pub fn script<I: IntoIterator<Item = SimOpen>>(&self, outcomes: I) {
        self.lock().script.extend(outcomes);
    }

    /// Changes how requests are answered from now on.
    pub fn set_behavior(&self, behavior: BankBehavior) {
        self.lock().behavior = behavior;
    }

    /// Number of opens attempted so far.
    pub fn open_attempts(&self) -> usize {
        self.lock().attempts.len()
    }

    /// Instants at which each open was attempted.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.lock().attempts.clone()
    }

    /// Every message the bank has received, heartbeats included.
    pub fn received(&self) -> Vec<WireMessage> {
        self.lock().received.clone()
    }

    /// True while a link is open.
    pub fn is_linked(&self) -> bool {
        self.lock()
            .link
            .as_ref()
            .is_some_and(|link| link.alive.load(Ordering::SeqCst))
    }

    fn push(&self, frame: SimFrame) -> bool {
        match self.lock().link.as_ref() {
            Some(link) if link.alive.load(Ordering::SeqCst) => link.to_client.send(frame).is_ok(),
            _ => false,
        }
    }

    fn end_link(&self, last: SimFrame) -> bool {
        let link = self.lock().link.take();
        match link {
            Some(link) => {
                link.alive.store(false, Ordering::SeqCst);
                link.to_client.send(last).is_ok()
            }
            None => false,
        }
    }

    /// Delivers `msg` to the client as if the bank had sent it.
    pub fn inject(&self, msg: WireMessage) -> bool {
        self.push(SimFrame::Message(msg))
    }

    /// Delivers a frame that fails to decode.
    pub fn inject_malformed(&self, reason: &str) -> bool {
        self.push(SimFrame::Malformed(reason.to_string()))
    }

    /// Closes the link cleanly from the bank's side.
    pub fn sever(&self) -> bool {
        self.end_link(SimFrame::Close)
    }

    /// Drops the link with an I/O error.
    pub fn reset(&self) -> bool {
        self.end_link(SimFrame::Reset)
    }

    /// Drops the link reporting that the bank refused our certificate.
    pub fn reject_certificate(&self) -> bool {
        self.end_link(SimFrame::RejectCertificate)
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Channel> {
        let outcome = {
            let mut state = self.lock();
            state.attempts.push(Instant::now());
            state.script.pop_front().unwrap_or(SimOpen::Accept)
        };

        match outcome {
            SimOpen::Accept => {}
            SimOpen::Refuse => {
                return Err(TransportError::ConnectRefused { addr: endpoint.addr() });
            }
            SimOpen::Timeout => {
                tokio::time::sleep(endpoint.connect_timeout()).await;
                return Err(TransportError::ConnectTimeout {
                    addr: endpoint.addr(),
                    timeout_ms: endpoint.connect_timeout_ms,
                });
            }
            SimOpen::RejectCertificate => {
                return Err(TransportError::CertificateValidationFailed {
                    reason: "invalid peer certificate: UnknownIssuer".to_string(),
                });
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let previous = self.lock().link.replace(SimLink {
            to_client: tx.clone(),
            alive: alive.clone(),
        });
        if let Some(previous) = previous {
            previous.alive.store(false, Ordering::SeqCst);
            let _ = previous.to_client.send(SimFrame::Close);
        }

        Ok(Channel {
            writer: Box::new(SimWriter {
                bank: self.clone(),
                to_client: tx,
                alive,
            }),
            reader: Box::new(SimReader { rx }),
            peer: format!("sim://{}", endpoint.name),
        })
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

struct SimWriter {
    bank: SimTransport,
    to_client: mpsc::UnboundedSender<SimFrame>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for SimWriter {
    async fn write_message(&mut self, msg: &WireMessage) -> Result<()> {
        // Same size limit as the stream binding.
        encode_message(msg)?;
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let behavior = {
            let mut state = self.bank.lock();
            state.received.push(msg.clone());
            state.behavior
        };
        let answer = match behavior {
            BankBehavior::Echo => true,
            BankBehavior::Silent => false,
            BankBehavior::EchoExceptHeartbeat => !msg.is_heartbeat(),
        };
        if let (true, Some(id)) = (answer, msg.id.as_ref()) {
            let reply = WireMessage::response(id.clone(), msg.data.clone());
            let _ = self.to_client.send(SimFrame::Message(reply));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct SimReader {
    rx: mpsc::UnboundedReceiver<SimFrame>,
}

#[async_trait]
impl FrameReader for SimReader {
    async fn read_message(&mut self) -> Result<Option<Inbound>> {
        match self.rx.recv().await {
            Some(SimFrame::Message(msg)) => Ok(Some(Inbound::Message(msg))),
            Some(SimFrame::Malformed(reason)) => Ok(Some(Inbound::Malformed(reason))),
            Some(SimFrame::Close) | None => Ok(None),
            Some(SimFrame::Reset) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by bank",
            ))),
            Some(SimFrame::RejectCertificate) => Err(TransportError::CertificateValidationFailed {
                reason: "received fatal alert: CertificateRequired".to_string(),
            }),
        }
    }
}
