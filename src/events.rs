//! Wires connection lifecycle callbacks (C5) into the hub and discovery
//! responder (C10). Kept as its own small adapter so `transport` stays
//! ignorant of the hub/health types it's wired into.

use crate::envelope::OutgoingMessage;
use crate::health::HealthSupervisor;
use crate::transport::{ConnectionEvents, ConnectionHandle, ConnectionHub};
use serde_json::Value;
use std::sync::Arc;

pub struct BrokerEvents {
    hub: Arc<ConnectionHub>,
    health: Arc<HealthSupervisor>,
}

impl BrokerEvents {
    pub fn new(hub: Arc<ConnectionHub>, health: Arc<HealthSupervisor>) -> Self {
        Self { hub, health }
    }
}

#[async_trait::async_trait]
impl ConnectionEvents for BrokerEvents {
    async fn on_connected(&self, handle: ConnectionHandle) {
        self.hub.register(handle);
    }

    async fn on_event(&self, session_id: String, name: String, payload: Value) {
        // Forwarding events to the AI-client transport is outside this
        // core (the non-goal excludes the client-facing RPC framing
        // that would deliver them); log for operator visibility instead.
        tracing::debug!(session_id, name, payload = %payload, "extension event");
    }

    async fn on_port_list_request(&self, connection: &ConnectionHandle) {
        let ports = self.health.active_ports();
        let response = OutgoingMessage::PortListResponse { ports };
        if let Err(e) = connection.send(response).await {
            tracing::warn!(error = %e, connection_id = %connection.connection_id, "failed to answer portListRequest");
        }
    }

    async fn on_closed(&self, port: u16, connection_id: &str) {
        self.hub.remove(port, connection_id);
    }
}
