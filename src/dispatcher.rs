//! Broker dispatcher (C9)
//!
//! The single entry point for client RPCs: resolve session, resolve tab,
//! acquire its lock, send the envelope, translate the response — six
//! steps, with the retry engine (C4) wrapping the send/await pair.

use crate::correlator::Correlator;
use crate::envelope::{OutgoingMessage, ResponseData, TabId};
use crate::error::{BrokerError, BrokerResult};
use crate::lock::TabLockScheduler;
use crate::retry::with_retry;
use crate::session::SessionRegistry;
use crate::transport::{ConnectionHandle, ConnectionHub};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub struct Dispatcher {
    sessions: Arc<SessionRegistry>,
    connections: Arc<ConnectionHub>,
    correlator: Arc<Correlator>,
    locks: Arc<TabLockScheduler>,
    command_timeout: Duration,
    lock_timeout: Duration,
    stale_threshold: Duration,
    max_retries: u32,
    /// The single extension port this broker instance claimed at startup.
    /// A session is implicitly bound to it on first contact — the
    /// AI-client RPC surface carries no port of its own.
    extension_port: u16,
}

/// One client-RPC call.
pub struct DispatchRequest {
    pub session_id: String,
    pub command_name: String,
    pub payload: Value,
    pub tab_id: Option<TabId>,
}

pub struct DispatchOutcome {
    pub data: Value,
    pub tab_id: Option<TabId>,
    pub attempts: u32,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        connections: Arc<ConnectionHub>,
        correlator: Arc<Correlator>,
        locks: Arc<TabLockScheduler>,
        command_timeout: Duration,
        lock_timeout: Duration,
        stale_threshold: Duration,
        max_retries: u32,
        extension_port: u16,
    ) -> Self {
        Self {
            sessions,
            connections,
            correlator,
            locks,
            command_timeout,
            lock_timeout,
            stale_threshold,
            max_retries,
            extension_port,
        }
    }

    /// Runs the six-step dispatch flow for one client RPC.
    pub async fn dispatch(&self, request: DispatchRequest) -> BrokerResult<DispatchOutcome> {
        // Step 1: locate or create the session (C6), binding it to this
        // instance's extension port on first contact if not already bound.
        let session = self.sessions.get_or_create(&request.session_id);
        session.touch();
        if session.port().is_none() {
            session.bind_port(self.extension_port);
        }

        let port = session.port().ok_or(BrokerError::NoConnection)?;
        if self.connections.get(port).is_none() {
            return Err(BrokerError::NoConnection);
        }

        // Step 2: determine target tab (C8). An explicit tabId wins; else
        // the session's last-focused tab; else the extension will mint a
        // new tab and tell us its id on response.
        let tab_id = request.tab_id.or_else(|| session.resolve_implicit_tab());

        // Step 3+4+5+6 live inside the retry loop: each attempt acquires
        // the lock fresh, sends with a fresh wireId, and always releases
        // the lock and drops the pending entry before returning, success
        // or failure. The connection handle is re-resolved
        // on every attempt rather than reused from before the loop, so a
        // reconnect between retries is picked up by the next attempt
        // instead of retrying against a dead handle forever.
        let sessions = &self.sessions;
        let connections = &self.connections;
        let command_timeout = self.command_timeout;
        let lock_timeout = self.lock_timeout;
        let stale_threshold = self.stale_threshold;

        let (result, attempts) = with_retry(self.max_retries, |_attempt| {
            let locks = self.locks.clone();
            let correlator = self.correlator.clone();
            let session = session.clone();
            let command_name = request.command_name.clone();
            let payload = request.payload.clone();

            async move {
                let connection = connections.get(port).filter(ConnectionHandle::is_open).ok_or(BrokerError::ConnectionClosed)?;

                let guard = if let Some(tab_id) = tab_id {
                    let key = (connection.port, tab_id);
                    Some(
                        locks
                            .acquire(key, &session.session_id, lock_timeout, stale_threshold, |sid| sessions.is_live(sid))
                            .await?,
                    )
                } else {
                    None
                };

                let wire_id = connection.wire_ids.next();
                let rx = correlator.register(&connection.connection_id, wire_id, &session.session_id, &command_name);

                let command = OutgoingMessage::Command {
                    wire_id,
                    session_id: session.session_id.clone(),
                    name: command_name,
                    payload,
                    tab_id,
                };

                let outcome = match connection.send(command).await {
                    Ok(()) => correlator.wait(&connection.connection_id, wire_id, rx, command_timeout).await,
                    Err(e) => {
                        correlator.resolve(&connection.connection_id, wire_id, Err(BrokerError::ConnectionClosed));
                        Err(e)
                    }
                };

                if let Some(guard) = guard {
                    guard.release();
                }

                outcome.map(|response: ResponseData| {
                    if let Some(new_tab) = response.tab_id {
                        session.set_focused_tab(new_tab);
                    }
                    response
                })
            }
        })
        .await;

        result.map(|response| DispatchOutcome { data: response.data, tab_id: response.tab_id, attempts })
    }

    /// Tears down a session: cancels pending requests, clears
    /// lock-queue waiters, marks the session terminated. Held locks are
    /// released by their own guards as the in-flight dispatch calls return
    /// (cancelling the correlator entry unblocks `wait`, which then drops
    /// the guard on its way out).
    pub fn destroy_session(&self, session_id: &str) {
        self.correlator.cancel_session(session_id);
        self.locks.cancel_session(session_id);
        if let Some(session) = self.sessions.get(session_id) {
            session.set_state(crate::session::SessionState::Terminated);
        }
        self.sessions.remove(session_id);
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}
