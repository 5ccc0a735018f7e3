//! Request correlation: ids out, replies back to the caller that asked.
//!
//! Every request settles exactly once. Whoever removes the pending entry
//! (the reply, the caller's own deadline, the sweeper, or `fail_all`)
//! decides the outcome; everyone else finds the entry gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

use crate::channel::ProtocolChannel;
use crate::error::{BridgeError, ProtocolError};
use crate::protocol::{WireRequest, WireResponse};

type Outcome = Result<serde_json::Value, BridgeError>;

struct PendingRequest {
    method: String,
    issued_at: Instant,
    deadline: Instant,
    waiter: oneshot::Sender<Outcome>,
}

impl PendingRequest {
    fn timeout_error(&self, id: u64, now: Instant) -> BridgeError {
        BridgeError::Timeout {
            id,
            method: self.method.clone(),
            elapsed: now.saturating_duration_since(self.issued_at),
        }
    }
}

/// Pending-request table for one analyzer session.
pub(crate) struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send `method` and wait for its reply, at most `timeout`.
    ///
    /// A wire error reply comes back as `BridgeError::Remote`. If this future
    /// is dropped early, the entry is left for [`Self::timeout_sweep`].
    pub async fn issue(
        &self,
        channel: &ProtocolChannel,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Outcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(WireRequest::new(id, method, params))
            .map_err(|e| ProtocolError::new(format!("serializing {method} request: {e}")))?;

        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at,
                deadline,
                waiter: tx,
            },
        );

        if let Err(e) = channel.send(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        tracing::trace!(id, method, "Request sent");

        tokio::select! {
            outcome = &mut rx => outcome.unwrap_or_else(|_| Err(BridgeError::terminated("request abandoned"))),
            () = tokio::time::sleep_until(deadline) => {
                let expired = self.pending.lock().await.remove(&id);
                match expired {
                    Some(pending) => {
                        tracing::debug!(id, method, "Request timed out");
                        Err(pending.timeout_error(id, Instant::now()))
                    }
                    // Settled concurrently; the outcome is already in flight.
                    None => rx
                        .await
                        .unwrap_or_else(|_| Err(BridgeError::terminated("request abandoned"))),
                }
            }
        }
    }

    /// Settle the request `response` answers. Returns `false` for an unknown
    /// id, e.g. a reply that arrives after its request timed out.
    pub async fn resolve(&self, response: WireResponse) -> bool {
        let Some(pending) = self.pending.lock().await.remove(&response.id) else {
            tracing::debug!(id = response.id, "Discarding reply for unknown request");
            return false;
        };
        let outcome = response.outcome.map_err(|e| BridgeError::Remote {
            code: e.code,
            message: e.message,
        });
        tracing::trace!(
            id = response.id,
            method = %pending.method,
            elapsed_ms = pending.issued_at.elapsed().as_millis(),
            "Reply received"
        );
        let _ = pending.waiter.send(outcome);
        true
    }

    /// Reject every request whose deadline is at or before `now`.
    pub async fn timeout_sweep(&self, now: Instant) -> usize {
        let expired: Vec<(u64, PendingRequest)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (id, pending) in expired {
            tracing::debug!(id, method = %pending.method, "Sweeping expired request");
            let err = pending.timeout_error(id, now);
            let _ = pending.waiter.send(Err(err));
        }
        count
    }

    /// Reject every outstanding request with `error` and empty the table.
    pub async fn fail_all(&self, error: BridgeError) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().await.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.waiter.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!(count, "Failed outstanding requests: {error}");
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
