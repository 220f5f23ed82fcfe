//! Heartbeat scheduling and liveness tracking.
//!
//! While a connection is live one scheduler task ticks at the heartbeat
//! interval and sends a probe through the ordinary request path. Any inbound
//! frame counts as liveness. Once nothing has been heard for twice the
//! interval, or a probe cannot be sent, the scheduler reports the
//! connection dead and exits; a new one is spawned after reconnection.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::SendError;

/// Snapshot of heartbeat counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Probes sent.
    pub sent: u64,
    /// Probes answered before their deadline.
    pub acknowledged: u64,
    /// Probes that timed out.
    pub missed: u64,
    /// Inbound frames that could not be decoded.
    pub malformed_frames: u64,
    /// Mean probe round trip, once at least one was answered.
    pub average_rtt: Option<Duration>,
    /// Time since anything was last received.
    pub since_last_inbound: Duration,
}

/// Liveness bookkeeping shared by the reader loop and the scheduler.
#[derive(Debug)]
pub struct Liveness {
    last_inbound: Mutex<Instant>,
    sent: AtomicU64,
    acknowledged: AtomicU64,
    missed: AtomicU64,
    malformed: AtomicU64,
    rtt_sum_us: AtomicU64,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    /// Creates a tracker that considers the channel alive as of now.
    pub fn new() -> Self {
        Self {
            last_inbound: Mutex::new(Instant::now()),
            sent: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            rtt_sum_us: AtomicU64::new(0),
        }
    }

    /// Restarts the silence clock for a fresh channel. Counters are kept.
    pub fn reset(&self) {
        self.record_inbound();
    }

    /// Records that some frame arrived.
    pub fn record_inbound(&self) {
        *self.last_inbound.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn silent_for(&self) -> Duration {
        self.last_inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack(&self, rtt: Duration) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.rtt_sum_us.fetch_add(rtt.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_missed(&self) {
        self.missed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> HeartbeatStats {
        let acknowledged = self.acknowledged.load(Ordering::Relaxed);
        let average_rtt = (acknowledged > 0).then(|| {
            Duration::from_micros(self.rtt_sum_us.load(Ordering::Relaxed) / acknowledged)
        });
        HeartbeatStats {
            sent: self.sent.load(Ordering::Relaxed),
            acknowledged,
            missed: self.missed.load(Ordering::Relaxed),
            malformed_frames: self.malformed.load(Ordering::Relaxed),
            average_rtt,
            since_last_inbound: self.silent_for(),
        }
    }
}

/// What the scheduler drives: the owning connection.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    /// Sends one probe on the channel of `generation` and waits for its
    /// response for at most `timeout`.
    async fn send_heartbeat(&self, generation: u64, timeout: Duration) -> Result<(), SendError>;

    /// Reports the channel of `generation` dead.
    fn heartbeat_dead(&self, generation: u64, reason: String);
}

/// Timing of one scheduler.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Time between probes.
    pub interval: Duration,
    /// How long one probe may wait for its response.
    pub probe_timeout: Duration,
}

impl HeartbeatConfig {
    /// Probes wait at most one interval, or the message timeout if shorter.
    pub fn new(interval: Duration, message_timeout: Duration) -> Self {
        Self {
            interval,
            probe_timeout: interval.min(message_timeout),
        }
    }

    /// Silence after which the channel is considered dead.
    pub fn dead_after(&self) -> Duration {
        self.interval.saturating_mul(2)
    }
}

/// Handle to a running scheduler. Dropping it stops the task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stops the scheduler. No tick fires after this returns.
    pub fn stop(self) {
        self.task.abort();
    }

    /// True once the scheduler has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts a scheduler for the channel of `generation`. The first probe goes
/// out one interval from now.
pub fn spawn(
    bank: String,
    sink: Weak<dyn HeartbeatSink>,
    liveness: Arc<Liveness>,
    generation: u64,
    config: HeartbeatConfig,
) -> HeartbeatHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(sink) = sink.upgrade() else {
                return;
            };

            let silent = liveness.silent_for();
            if silent >= config.dead_after() {
                warn!(
                    bank = %bank,
                    event = "heartbeatFailed",
                    silent_ms = silent.as_millis() as u64,
                    "no traffic from bank, declaring connection dead"
                );
                sink.heartbeat_dead(generation, format!("no liveness for {}ms", silent.as_millis()));
                return;
            }

            liveness.record_sent();
            let started = Instant::now();
            match sink.send_heartbeat(generation, config.probe_timeout).await {
                Ok(()) => {
                    let rtt = started.elapsed();
                    liveness.record_ack(rtt);
                    debug!(bank = %bank, rtt_us = rtt.as_micros() as u64, "heartbeat acknowledged");
                }
                Err(SendError::Timeout { .. }) => {
                    liveness.record_missed();
                    warn!(
                        bank = %bank,
                        event = "heartbeatFailed",
                        timeout_ms = config.probe_timeout.as_millis() as u64,
                        "heartbeat unanswered"
                    );
                }
                // The connection already knows; recovery is under way.
                Err(e) if e.is_channel_failure() => return,
                Err(e) => {
                    warn!(bank = %bank, event = "heartbeatFailed", error = %e, "heartbeat could not be sent");
                    sink.heartbeat_dead(generation, e.to_string());
                    return;
                }
            }
        }
    });
    HeartbeatHandle { task }
}
