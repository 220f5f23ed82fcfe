//! The bank connection facade and its lifecycle state machine.
//!
//! ```text
//! Disconnected --connect()--> Connecting --open ok--> Connected
//!      ^                          |  ^                    |
//!      |        cert failure /    |  |  channel lost /    |
//!      +------- exhausted --------+  +--- heartbeat dead -+
//!      |                                                  |
//!      +------ Disconnecting <-------- disconnect() ------+
//! ```
//!
//! Every transition happens under the lifecycle lock and bumps a
//! generation counter when it invalidates the current channel. Background
//! tasks (reader loop, heartbeat scheduler, reconnection) carry the
//! generation they were started for and become no-ops once it is stale, so
//! only one of them ever acts on a given channel.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::is_retryable;
use crate::config::EndpointConfig;
use crate::error::{ConnectError, SendError, TransportError};
use crate::heartbeat::{self, HeartbeatConfig, HeartbeatHandle, HeartbeatSink, HeartbeatStats, Liveness};
use crate::message::{heartbeat_payload, next_message_id, WireMessage};
use crate::registry::CorrelationRegistry;
use crate::transport::{for_binding, Channel, FrameReader, FrameWriter, Inbound, Transport};

/// Consecutive undecodable frames after which the stream is considered
/// corrupted beyond recovery.
pub const MAX_MALFORMED_STREAK: u32 = 3;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel and no recovery in progress.
    Disconnected,
    /// Opening a channel, possibly waiting out a backoff delay.
    Connecting,
    /// A channel is open and requests may be sent.
    Connected,
    /// An explicit disconnect is tearing the channel down.
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications, delivered to each subscriber in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A channel was opened.
    Connected {
        /// Peer description from the transport.
        peer: String,
    },
    /// The channel went away, or recovery stopped on a fatal error.
    Disconnected {
        /// Why.
        reason: String,
    },
    /// A reconnection attempt is scheduled after `delay`.
    Reconnecting {
        /// 1-indexed retry number.
        attempt: u32,
        /// Backoff delay before the attempt.
        delay: Duration,
    },
    /// The retry budget is spent. Nothing further happens until `connect`.
    ReconnectionExhausted {
        /// Retries made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: String,
    },
}

enum LossCause {
    Closed,
    Failed(TransportError),
    Corrupted(u32),
    HeartbeatDead(String),
}

impl LossCause {
    fn is_certificate_rejection(&self) -> bool {
        matches!(self, LossCause::Failed(TransportError::CertificateValidationFailed { .. }))
    }
}

impl fmt::Display for LossCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossCause::Closed => f.write_str("channel closed by bank"),
            LossCause::Failed(e) => write!(f, "{}", e),
            LossCause::Corrupted(n) => write!(f, "stream corrupted: {} consecutive malformed frames", n),
            LossCause::HeartbeatDead(reason) => write!(f, "heartbeat failed: {}", reason),
        }
    }
}

type SharedWriter = Arc<AsyncMutex<Box<dyn FrameWriter>>>;

struct Session {
    generation: u64,
    peer: String,
    writer: SharedWriter,
    reader: JoinHandle<()>,
    heartbeat: Option<HeartbeatHandle>,
}

impl Session {
    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
    }

    async fn close(mut self, timeout: Duration) -> Result<(), TransportError> {
        self.stop_heartbeat();
        self.reader.abort();
        let writer = self.writer.clone();
        match tokio::time::timeout(timeout, async move { writer.lock().await.close().await }).await {
            Ok(result) => result,
            Err(_) => {
                warn!(peer = %self.peer, "channel close timed out");
                Ok(())
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct Lifecycle {
    state: ConnectionState,
    retry_count: u32,
    generation: u64,
    session: Option<Session>,
    reconnect: Option<JoinHandle<()>>,
}

struct Shared {
    this: Weak<Shared>,
    config: EndpointConfig,
    transport: Arc<dyn Transport>,
    registry: CorrelationRegistry,
    liveness: Arc<Liveness>,
    lifecycle: Mutex<Lifecycle>,
    events: broadcast::Sender<ConnectionEvent>,
    generation_tx: watch::Sender<u64>,
}

/// Resolves once the lifecycle generation moves away from `generation`.
async fn superseded(rx: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        if *rx.borrow_and_update() != generation {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bank(&self) -> &str {
        &self.config.name
    }

    // Called with the lifecycle lock held so subscribers see transition order.
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn advance_generation(&self, lc: &mut Lifecycle) -> u64 {
        lc.generation += 1;
        self.generation_tx.send_replace(lc.generation);
        lc.generation
    }

    /// Opens a channel for `generation`, retrying under backoff. Retries
    /// are numbered from `first_retry`; 0 means one immediate attempt comes
    /// first.
    async fn establish(&self, generation: u64, first_retry: u32) -> Result<(), ConnectError> {
        let policy = self.config.backoff();
        let mut rx = self.generation_tx.subscribe();
        let mut attempt = first_retry;

        loop {
            if attempt > 0 {
                let delay = policy.delay_for(attempt);
                {
                    let mut lc = self.lifecycle();
                    if lc.generation != generation {
                        return Err(ConnectError::Cancelled);
                    }
                    lc.retry_count = attempt;
                    self.emit(ConnectionEvent::Reconnecting { attempt, delay });
                }
                info!(
                    bank = %self.bank(),
                    event = "reconnectAttempt",
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnection"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = superseded(&mut rx, generation) => return Err(ConnectError::Cancelled),
                }
            }

            let opened = tokio::select! {
                opened = self.transport.open(&self.config) => opened,
                _ = superseded(&mut rx, generation) => return Err(ConnectError::Cancelled),
            };

            let err = match opened {
                Ok(channel) => return self.install(generation, channel),
                Err(e) => ConnectError::from(e),
            };

            if !is_retryable(&err) {
                error!(bank = %self.bank(), event = "certificateValidationFailed", error = %err, "giving up without retry");
                let mut lc = self.lifecycle();
                if lc.generation == generation {
                    lc.state = ConnectionState::Disconnected;
                    lc.reconnect = None;
                    self.emit(ConnectionEvent::Disconnected { reason: err.to_string() });
                }
                return Err(err);
            }

            warn!(bank = %self.bank(), attempt, error = %err, "connection attempt failed");
            if policy.is_exhausted(attempt) {
                let last_error = err.to_string();
                error!(
                    bank = %self.bank(),
                    event = "reconnectionExhausted",
                    attempts = attempt,
                    last_error = %last_error,
                    "reconnection budget exhausted"
                );
                let mut lc = self.lifecycle();
                if lc.generation != generation {
                    return Err(ConnectError::Cancelled);
                }
                lc.state = ConnectionState::Disconnected;
                lc.reconnect = None;
                self.emit(ConnectionEvent::ReconnectionExhausted {
                    attempts: attempt,
                    last_error: last_error.clone(),
                });
                return Err(ConnectError::ReconnectionExhausted {
                    attempts: attempt,
                    last_error,
                });
            }
            attempt += 1;
        }
    }

    fn install(&self, generation: u64, channel: Channel) -> Result<(), ConnectError> {
        let Channel { mut writer, reader, peer } = channel;
        let mut lc = self.lifecycle();
        if lc.generation != generation || lc.state != ConnectionState::Connecting {
            drop(lc);
            debug!(bank = %self.bank(), peer = %peer, "discarding channel opened for a superseded attempt");
            tokio::spawn(async move {
                let _ = writer.close().await;
            });
            return Err(ConnectError::Cancelled);
        }

        self.liveness.reset();
        let reader = tokio::spawn(read_loop(self.this.clone(), generation, reader));
        let sink: Weak<dyn HeartbeatSink> = self.this.clone();
        let heartbeat = heartbeat::spawn(
            self.config.name.clone(),
            sink,
            self.liveness.clone(),
            generation,
            HeartbeatConfig::new(self.config.heartbeat_interval(), self.config.message_timeout()),
        );

        lc.session = Some(Session {
            generation,
            peer: peer.clone(),
            writer: Arc::new(AsyncMutex::new(writer)),
            reader,
            heartbeat: Some(heartbeat),
        });
        lc.state = ConnectionState::Connected;
        lc.reconnect = None;
        info!(bank = %self.bank(), event = "connected", peer = %peer, "connected to bank");
        self.emit(ConnectionEvent::Connected { peer });
        Ok(())
    }

    /// Handles loss of the channel of `generation`. Stale reports are
    /// ignored, so whichever of reader, heartbeat or sender notices first
    /// drives recovery.
    fn connection_lost(&self, generation: u64, cause: LossCause) {
        let mut lc = self.lifecycle();
        let current = lc.session.as_ref().map(|s| s.generation);
        if lc.state != ConnectionState::Connected || current != Some(generation) {
            debug!(bank = %self.bank(), generation, cause = %cause, "ignoring loss of superseded channel");
            return;
        }

        let reason = cause.to_string();
        let mut session = lc.session.take();
        if let Some(session) = session.as_mut() {
            session.stop_heartbeat();
        }
        let next = self.advance_generation(&mut lc);
        self.registry.reject_all(SendError::ConnectionLost { reason: reason.clone() });
        warn!(bank = %self.bank(), event = "disconnected", reason = %reason, "connection lost");
        self.emit(ConnectionEvent::Disconnected { reason: reason.clone() });

        let timeout = self.config.connect_timeout();
        let policy = self.config.backoff();
        let fatal = cause.is_certificate_rejection() || policy.is_exhausted(lc.retry_count);
        if cause.is_certificate_rejection() {
            error!(bank = %self.bank(), event = "certificateValidationFailed", reason = %reason, "bank rejected our certificate");
        } else if fatal {
            // Every retry of this cycle reached the bank, which dropped the
            // channel before sending anything.
            error!(
                bank = %self.bank(),
                event = "reconnectionExhausted",
                attempts = lc.retry_count,
                last_error = %reason,
                "reconnection budget exhausted"
            );
            self.emit(ConnectionEvent::ReconnectionExhausted {
                attempts: lc.retry_count,
                last_error: reason.clone(),
            });
        }
        if fatal {
            lc.state = ConnectionState::Disconnected;
            lc.reconnect = None;
            if let Some(session) = session {
                tokio::spawn(async move {
                    let _ = session.close(timeout).await;
                });
            }
            return;
        }

        let Some(this) = self.this.upgrade() else {
            lc.state = ConnectionState::Disconnected;
            return;
        };
        let first_retry = lc.retry_count + 1;
        lc.state = ConnectionState::Connecting;
        lc.reconnect = Some(tokio::spawn(async move {
            if let Some(session) = session {
                if let Err(e) = session.close(timeout).await {
                    debug!(bank = %this.bank(), error = %e, "closing lost channel");
                }
            }
            // Outcome is reported through events and logs.
            let _ = this.establish(next, first_retry).await;
        }));
    }

    /// The bank has spoken on the channel of `generation`, so the
    /// reconnection cycle that produced it is over.
    fn heard_from_bank(&self, generation: u64) {
        let mut lc = self.lifecycle();
        if lc.generation == generation && lc.retry_count != 0 {
            debug!(bank = %self.bank(), retries = lc.retry_count, "channel confirmed by bank");
            lc.retry_count = 0;
        }
    }

    /// Returns a connection whose `connect` future was dropped mid-flight to
    /// `Disconnected`.
    fn abandon_connect(&self, generation: u64) {
        let mut lc = self.lifecycle();
        if lc.generation != generation || lc.state != ConnectionState::Connecting {
            return;
        }
        self.advance_generation(&mut lc);
        lc.state = ConnectionState::Disconnected;
        info!(bank = %self.bank(), event = "disconnected", reason = "connect abandoned", "connect abandoned by caller");
        self.emit(ConnectionEvent::Disconnected {
            reason: "connect abandoned".to_string(),
        });
    }

    async fn request(&self, data: Value, timeout: Duration, expect: Option<u64>) -> Result<Value, SendError> {
        let id = next_message_id();
        let (mut pending, writer, generation) = {
            let lc = self.lifecycle();
            let session = match (lc.state, lc.session.as_ref()) {
                (ConnectionState::Connected, Some(session)) => session,
                _ => return Err(SendError::NotConnected),
            };
            if expect.is_some_and(|g| g != session.generation) {
                return Err(SendError::ConnectionLost {
                    reason: "channel superseded".to_string(),
                });
            }
            let pending = self.registry.register(id.clone(), timeout)?;
            (pending, session.writer.clone(), session.generation)
        };

        let msg = WireMessage::request(id.clone(), data);
        debug!(bank = %self.bank(), id = %id, timeout_ms = timeout.as_millis() as u64, "sending request");

        // Written from its own task so an abandoned caller never leaves half
        // a frame on the wire.
        let mut write = tokio::spawn(async move { writer.lock().await.write_message(&msg).await });

        tokio::select! {
            biased;
            written = &mut write => {
                let written = written.unwrap_or_else(|e| Err(TransportError::Io(std::io::Error::other(e))));
                if let Err(e) = written {
                    if e.is_channel_failure() {
                        let rejection = SendError::ConnectionLost { reason: e.to_string() };
                        self.connection_lost(generation, LossCause::Failed(e));
                        self.registry.reject(&id, rejection);
                    } else {
                        warn!(bank = %self.bank(), id = %id, error = %e, "request could not be encoded");
                        self.registry.reject(&id, SendError::from(e));
                    }
                }
            }
            outcome = &mut pending => return outcome,
        }
        pending.await
    }
}

#[async_trait]
impl HeartbeatSink for Shared {
    async fn send_heartbeat(&self, generation: u64, timeout: Duration) -> Result<(), SendError> {
        self.request(heartbeat_payload(), timeout, Some(generation))
            .await
            .map(|_| ())
    }

    fn heartbeat_dead(&self, generation: u64, reason: String) {
        self.connection_lost(generation, LossCause::HeartbeatDead(reason));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let lc = self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(reconnect) = lc.reconnect.take() {
            reconnect.abort();
        }
        lc.session = None;
    }
}

async fn read_loop(shared: Weak<Shared>, generation: u64, mut reader: Box<dyn FrameReader>) {
    let mut malformed_streak = 0u32;
    let mut heard = false;
    loop {
        let item = reader.read_message().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !heard && matches!(item, Ok(Some(_))) {
            heard = true;
            shared.heard_from_bank(generation);
        }

        match item {
            Ok(Some(Inbound::Message(msg))) => {
                malformed_streak = 0;
                shared.liveness.record_inbound();
                match msg.id {
                    Some(id) => {
                        shared.registry.resolve(&id, msg.data);
                    }
                    None => debug!(bank = %shared.bank(), "dropping bank-initiated message without id"),
                }
            }
            Ok(Some(Inbound::Malformed(reason))) => {
                malformed_streak += 1;
                shared.liveness.record_inbound();
                shared.liveness.record_malformed();
                warn!(
                    bank = %shared.bank(),
                    event = "malformedFrame",
                    streak = malformed_streak,
                    reason = %reason,
                    "discarding malformed frame"
                );
                if malformed_streak >= MAX_MALFORMED_STREAK {
                    shared.connection_lost(generation, LossCause::Corrupted(malformed_streak));
                    return;
                }
            }
            Ok(None) => {
                shared.connection_lost(generation, LossCause::Closed);
                return;
            }
            Err(e) => {
                shared.connection_lost(generation, LossCause::Failed(e));
                return;
            }
        }
    }
}

/// Drop guard for a `connect` call still establishing its channel.
struct PendingConnect<'a> {
    shared: &'a Shared,
    generation: u64,
    armed: bool,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon_connect(self.generation);
        }
    }
}

/// One logical connection to a bank endpoint.
///
/// Cloning yields another handle to the same connection. Requests may be
/// sent concurrently from any number of tasks; each waits only on its own
/// response.
#[derive(Clone)]
pub struct BankConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for BankConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BankConnection")
            .field("bank", &self.shared.config.name)
            .field("transport", &self.shared.transport.name())
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl BankConnection {
    /// Creates a disconnected connection using the binding named in `config`.
    pub fn new(config: EndpointConfig) -> Self {
        let transport = for_binding(config.binding);
        Self::with_transport(config, transport)
    }

    /// Creates a disconnected connection over a caller-supplied transport.
    pub fn with_transport(config: EndpointConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (generation_tx, _) = watch::channel(0);
        let registry = CorrelationRegistry::new(config.name.clone());
        let shared = Arc::new_cyclic(|this| Shared {
            this: this.clone(),
            config,
            transport,
            registry,
            liveness: Arc::new(Liveness::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Disconnected,
                retry_count: 0,
                generation: 0,
                session: None,
                reconnect: None,
            }),
            events,
            generation_tx,
        });
        Self { shared }
    }

    /// Opens the channel. Failed attempts are retried under backoff; a
    /// certificate failure is returned at once. Dropping the returned
    /// future abandons the attempt and leaves the connection `Disconnected`.
    ///
    /// Returns immediately if already connected, and fails with
    /// `InvalidState` while another connect, reconnection or disconnect is
    /// in progress.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let generation = {
            let mut lc = self.shared.lifecycle();
            match lc.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    return Err(ConnectError::InvalidState {
                        state: lc.state.to_string(),
                    })
                }
                ConnectionState::Disconnected => {}
            }
            lc.state = ConnectionState::Connecting;
            lc.retry_count = 0;
            self.shared.advance_generation(&mut lc)
        };
        info!(
            bank = %self.shared.bank(),
            addr = %self.shared.config.addr(),
            transport = self.shared.transport.name(),
            "connecting"
        );
        let mut pending = PendingConnect {
            shared: &self.shared,
            generation,
            armed: true,
        };
        let result = self.shared.establish(generation, 0).await;
        pending.armed = false;
        result
    }

    /// Sends `payload` and waits for the correlated response. `timeout`
    /// defaults to the endpoint's message timeout.
    pub async fn send(&self, payload: Value, timeout: Option<Duration>) -> Result<Value, SendError> {
        let timeout = timeout.unwrap_or_else(|| self.shared.config.message_timeout());
        self.shared.request(payload, timeout, None).await
    }

    /// Closes the channel and stops any recovery. Every outstanding request
    /// is rejected with `Cancelled` before this returns. Disconnecting an
    /// idle connection is a no-op.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let session = {
            let mut lc = self.shared.lifecycle();
            let recovering = lc.reconnect.as_ref().is_some_and(|task| !task.is_finished());
            if lc.state == ConnectionState::Disconnected && lc.session.is_none() && !recovering {
                return Ok(());
            }
            lc.state = ConnectionState::Disconnecting;
            self.shared.advance_generation(&mut lc);
            if let Some(reconnect) = lc.reconnect.take() {
                reconnect.abort();
            }
            let mut session = lc.session.take();
            if let Some(session) = session.as_mut() {
                session.stop_heartbeat();
            }
            self.shared.registry.reject_all(SendError::Cancelled);
            session
        };

        let result = match session {
            Some(session) => session.close(self.shared.config.connect_timeout()).await,
            None => Ok(()),
        };

        let mut lc = self.shared.lifecycle();
        lc.state = ConnectionState::Disconnected;
        info!(bank = %self.shared.bank(), event = "disconnected", reason = "requested", "disconnected from bank");
        self.shared.emit(ConnectionEvent::Disconnected {
            reason: "disconnect requested".to_string(),
        });
        result
    }

    /// Subscribes to lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle().state
    }

    /// True while a channel is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Retry number of the current reconnection cycle. Drops to 0 once the
    /// bank has sent something on the new channel.
    pub fn retry_count(&self) -> u32 {
        self.shared.lifecycle().retry_count
    }

    /// Requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.registry.len()
    }

    /// Peer of the open channel, if any.
    pub fn peer(&self) -> Option<String> {
        self.shared.lifecycle().session.as_ref().map(|s| s.peer.clone())
    }

    /// Heartbeat counters for the current and previous channels.
    pub fn heartbeat_stats(&self) -> HeartbeatStats {
        self.shared.liveness.stats()
    }

    /// Bank network name.
    pub fn name(&self) -> &str {
        self.shared.bank()
    }

    /// Endpoint settings this connection was built with.
    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }
}
