//! Correlation registry: outstanding requests keyed by correlation id.
//!
//! Each pending request ends exactly once, by resolution, rejection or
//! deadline expiry. Whoever removes the entry from the map settles it, so
//! a response racing its own timer can never settle a request twice.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SendError;

type Outcome = std::result::Result<Value, SendError>;

struct PendingRequest {
    submitted_at: Instant,
    responder: oneshot::Sender<Outcome>,
    timer: JoinHandle<()>,
}

impl PendingRequest {
    fn settle(self, outcome: Outcome) {
        self.timer.abort();
        // The caller may have stopped waiting; nothing left to notify.
        let _ = self.responder.send(outcome);
    }
}

struct RegistryInner {
    endpoint: String,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, id: &str, timeout: Duration) {
        let entry = self.lock().remove(id);
        if let Some(entry) = entry {
            debug!(bank = %self.endpoint, id, timeout_ms = timeout.as_millis() as u64, "request deadline expired");
            let _ = entry.responder.send(Err(SendError::Timeout {
                id: id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }));
        }
    }

    fn discard(&self, id: &str) {
        let entry = self.lock().remove(id);
        if let Some(entry) = entry {
            entry.timer.abort();
        }
    }
}

/// Thread-safe map of in-flight requests for one connection.
#[derive(Clone)]
pub struct CorrelationRegistry {
    inner: Arc<RegistryInner>,
}

impl CorrelationRegistry {
    /// Creates an empty registry; `endpoint` labels log events.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                endpoint: endpoint.into(),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers `id` and arms its deadline timer. The returned future
    /// settles with the correlated payload or the rejection reason.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, id: impl Into<String>, timeout: Duration) -> Result<PendingResponse, SendError> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let mut pending = self.inner.lock();
        if pending.contains_key(&id) {
            return Err(SendError::DuplicateId(id));
        }

        // The timer is spawned while the map is locked, so it cannot look
        // for the entry before it has been inserted.
        let deadline = Instant::now() + timeout;
        let weak = Arc::downgrade(&self.inner);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&timer_id, timeout);
            }
        });

        pending.insert(
            id.clone(),
            PendingRequest {
                submitted_at: Instant::now(),
                responder: tx,
                timer,
            },
        );
        Ok(PendingResponse {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Fulfils the request `id` with `payload`. Returns false (and drops the
    /// payload) when no such request is outstanding.
    pub fn resolve(&self, id: &str, payload: Value) -> bool {
        let entry = self.inner.lock().remove(id);
        match entry {
            Some(entry) => {
                debug!(
                    bank = %self.inner.endpoint,
                    id,
                    elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
                    "response correlated"
                );
                entry.settle(Ok(payload));
                true
            }
            None => {
                debug!(bank = %self.inner.endpoint, id, "dropping response for unknown request");
                false
            }
        }
    }

    /// Rejects a single request. Returns false if it was not outstanding.
    pub fn reject(&self, id: &str, error: SendError) -> bool {
        let entry = self.inner.lock().remove(id);
        match entry {
            Some(entry) => {
                entry.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Rejects every outstanding request with `error` and returns how many
    /// were rejected.
    pub fn reject_all(&self, error: SendError) -> usize {
        let drained: Vec<PendingRequest> = self.inner.lock().drain().map(|(_, v)| v).collect();
        let count = drained.len();
        if count > 0 {
            warn!(bank = %self.inner.endpoint, count, reason = %error, "rejecting outstanding requests");
        }
        for entry in drained {
            entry.settle(Err(error.clone()));
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `id` is outstanding.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("endpoint", &self.inner.endpoint)
            .field("pending", &self.len())
            .finish()
    }
}

/// Future resolving to the response of one registered request.
///
/// Dropping it before it settles withdraws the request from the registry
/// and cancels its deadline timer.
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<Outcome>,
    registry: Weak<RegistryInner>,
}

impl PendingResponse {
    /// Correlation id of the request.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingResponse {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(SendError::Cancelled)))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.discard(&self.id);
        }
    }
}
