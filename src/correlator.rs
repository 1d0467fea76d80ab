//! Request correlator (C3)
//!
//! Maps `(connectionId, wireId) -> PendingRequest`. Wire ids are only
//! monotonic per connection (each `ConnectionHandle` owns its own
//! `WireIdGenerator`), so the connection id is part of the key — two
//! different extensions can otherwise hand back colliding wire ids.
//! Responses may arrive in any order relative to sends; correlation is by
//! id alone, no FIFO assumption over the wire.

use crate::envelope::{ResponseData, WireId};
use crate::error::BrokerError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

type Resolution = Result<ResponseData, BrokerError>;
type Key = (String, WireId);

struct PendingRequest {
    resolver: oneshot::Sender<Resolution>,
    session_id: String,
    command_name: String,
}

/// The correlator is one per broker process; each entry is independently
/// namespaced by connection id.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<Key, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new in-flight request and returns a future that resolves
    /// when the response arrives, the deadline passes, or the connection is
    /// torn down. Exactly one of those three resolves this handle.
    pub fn register(
        &self,
        connection_id: &str,
        wire_id: WireId,
        session_id: &str,
        command_name: &str,
    ) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingRequest {
            resolver: tx,
            session_id: session_id.to_string(),
            command_name: command_name.to_string(),
        };
        self.pending.lock().unwrap().insert((connection_id.to_string(), wire_id), entry);
        rx
    }

    /// Waits for a registered request to resolve, enforcing the per-call
    /// deadline. On timeout, removes the entry so a late response is
    /// discarded (with a warning) rather than resolving a dead waiter.
    pub async fn wait(
        &self,
        connection_id: &str,
        wire_id: WireId,
        rx: oneshot::Receiver<Resolution>,
        deadline: Duration,
    ) -> Resolution {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without resolving — treat as connection loss.
                self.pending.lock().unwrap().remove(&(connection_id.to_string(), wire_id));
                Err(BrokerError::ConnectionClosed)
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&(connection_id.to_string(), wire_id));
                Err(BrokerError::MessageTimeout)
            }
        }
    }

    /// Called from the connection's reader task when a response envelope
    /// arrives. Discards (with a warning) if no matching pending entry
    /// exists — the response may have already timed out or belongs to a
    /// wire id from a prior broker incarnation.
    pub fn resolve(&self, connection_id: &str, wire_id: WireId, result: Resolution) {
        let entry = self.pending.lock().unwrap().remove(&(connection_id.to_string(), wire_id));
        match entry {
            Some(entry) => {
                let _ = entry.resolver.send(result);
            }
            None => {
                tracing::warn!(connection_id, wire_id, "discarding response for unknown or already-resolved wire id");
            }
        }
    }

    /// Fails every pending request belonging to `connection_id` with a
    /// retryable `ConnectionClosed` error — used when the underlying
    /// socket drops so in-flight callers retry against a reconnect rather
    /// than hanging until their deadline.
    pub fn fail_connection(&self, connection_id: &str) {
        let mut pending = self.pending.lock().unwrap();
        let dead: Vec<Key> = pending
            .keys()
            .filter(|(cid, _)| cid == connection_id)
            .cloned()
            .collect();
        for key in dead {
            if let Some(entry) = pending.remove(&key) {
                tracing::debug!(wire_id = key.1, command = %entry.command_name, "failing pending request: connection closed");
                let _ = entry.resolver.send(Err(BrokerError::ConnectionClosed));
            }
        }
    }

    /// Cancels every pending request belonging to `session_id` (session
    /// torn down) with a terminal `Cancelled` error, regardless of which
    /// connection it was sent on.
    pub fn cancel_session(&self, session_id: &str) {
        let mut pending = self.pending.lock().unwrap();
        let dead: Vec<Key> = pending
            .iter()
            .filter(|(_, entry)| entry.session_id == session_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in dead {
            if let Some(entry) = pending.remove(&key) {
                let _ = entry.resolver.send(Err(BrokerError::Cancelled("session destroyed".into())));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
