//! Connection hub (C5 + C10)
//!
//! Tracks the one live `ConnectionHandle` per port and answers extension
//! discovery queries — an extension asks the broker which ports are
//! already taken before picking its own.

use super::connection::ConnectionHandle;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct ConnectionHub {
    by_port: Mutex<HashMap<u16, ConnectionHandle>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.by_port.lock().unwrap().insert(handle.port, handle);
    }

    /// Removes the entry for `connection_id` only if it is still the
    /// current occupant of its port — a reconnect may already have
    /// replaced it by the time the old connection's teardown runs.
    pub fn remove(&self, port: u16, connection_id: &str) {
        let mut by_port = self.by_port.lock().unwrap();
        if by_port.get(&port).is_some_and(|h| h.connection_id == connection_id) {
            by_port.remove(&port);
        }
    }

    pub fn get(&self, port: u16) -> Option<ConnectionHandle> {
        self.by_port.lock().unwrap().get(&port).cloned()
    }

    pub fn ports_in_use(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.by_port.lock().unwrap().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn connection_count(&self) -> usize {
        self.by_port.lock().unwrap().len()
    }
}
