//! Health / supervision (C11) and discovery responder (C10)
//!
//! C10 and C11 share the same read of the port registry and connection
//! hub, so they live side by side here rather than as separate modules.

use crate::correlator::Correlator;
use crate::lock::TabLockScheduler;
use crate::registry::PortRegistry;
use crate::session::SessionRegistry;
use crate::transport::ConnectionHub;
use serde::Serialize;
use std::sync::Arc;

pub struct HealthSupervisor {
    registry: Arc<PortRegistry>,
    sessions: Arc<SessionRegistry>,
    connections: Arc<ConnectionHub>,
    correlator: Arc<Correlator>,
    instance_id: String,
}

#[derive(Serialize)]
pub struct Snapshot {
    pub instance_id: String,
    pub ports: Vec<u16>,
    pub sessions: Vec<SessionSummary>,
    pub connection_count: usize,
    pub pending_requests: usize,
}

#[derive(Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: &'static str,
    pub owned_tabs: Vec<i64>,
    pub last_focused_tab: Option<i64>,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<PortRegistry>,
        sessions: Arc<SessionRegistry>,
        connections: Arc<ConnectionHub>,
        correlator: Arc<Correlator>,
        instance_id: String,
    ) -> Self {
        Self { registry, sessions, connections, correlator, instance_id }
    }

    /// Answers `portListRequest`: every currently-active broker-instance
    /// port, read fresh from the registry.
    pub fn active_ports(&self) -> Vec<u16> {
        self.registry
            .list_active()
            .map(|entries| entries.into_iter().map(|e| e.port).collect())
            .unwrap_or_default()
    }

    /// Builds the read-only diagnostic snapshot.
    pub fn snapshot(&self) -> Snapshot {
        let sessions = self
            .sessions
            .list()
            .into_iter()
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                state: match s.state() {
                    crate::session::SessionState::Nascent => "nascent",
                    crate::session::SessionState::Active => "active",
                    crate::session::SessionState::Draining => "draining",
                    crate::session::SessionState::Terminated => "terminated",
                },
                owned_tabs: s.owned_tabs(),
                last_focused_tab: s.last_focused_tab(),
            })
            .collect();

        Snapshot {
            instance_id: self.instance_id.clone(),
            ports: self.connections.ports_in_use(),
            sessions,
            connection_count: self.connections.connection_count(),
            pending_requests: self.correlator.pending_count(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        // A freshly started broker with no extension attached yet is still
        // healthy — health reflects process liveness, not attachment state.
        true
    }
}

/// Runs the graceful shutdown sequence: stop accepting new work,
/// cancel every live session (which cascades into pending-request and
/// lock-queue cleanup), then release the port-registry entry. Closing the
/// listener sockets themselves is handled by the caller via the
/// `shutdown` watch channel passed to each acceptor.
pub async fn drain(
    sessions: &SessionRegistry,
    locks: &TabLockScheduler,
    correlator: &Correlator,
    registry: &PortRegistry,
    instance_id: &str,
) {
    tracing::info!("beginning graceful shutdown drain sequence");
    for session in sessions.list() {
        correlator.cancel_session(&session.session_id);
        locks.cancel_session(&session.session_id);
        session.set_state(crate::session::SessionState::Terminated);
    }
    if let Err(e) = registry.release_port(instance_id) {
        tracing::warn!(error = %e, "failed to release port-registry entry during shutdown");
    }
    tracing::info!("graceful shutdown drain sequence complete");
}
