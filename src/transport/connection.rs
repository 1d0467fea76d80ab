//! A single extension connection (C5)
//!
//! One axum WebSocket per extension instance, bound to a fixed port
//! claimed from the registry. Writes are serialized through an mpsc
//! channel to a dedicated writer task — `WebSocket` is not `Clone` and
//! concurrent `send`s from the dispatcher and the ping timer would
//! otherwise race.

use crate::correlator::Correlator;
use crate::envelope::{IncomingMessage, OutgoingMessage, WireIdGenerator};
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Shared handle to a live connection, cheaply cloneable and held by the
/// session registry and the dispatcher to address commands at this
/// extension instance.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub port: u16,
    pub(crate) outgoing: mpsc::Sender<OutgoingMessage>,
    pub(crate) open: Arc<AtomicBool>,
    pub wire_ids: Arc<WireIdGenerator>,
}

impl ConnectionHandle {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub async fn send(&self, message: OutgoingMessage) -> Result<(), crate::error::BrokerError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| crate::error::BrokerError::SendError("connection writer task has exited".into()))
    }
}

/// Callback surface the connection reader invokes as frames arrive. Kept
/// as a trait rather than a handful of channels so `run` stays agnostic
/// to how the session registry/correlator/discovery responder are wired
/// together.
#[async_trait::async_trait]
pub trait ConnectionEvents: Send + Sync {
    async fn on_connected(&self, handle: ConnectionHandle);
    async fn on_event(&self, session_id: String, name: String, payload: serde_json::Value);
    async fn on_port_list_request(&self, connection: &ConnectionHandle);
    async fn on_closed(&self, port: u16, connection_id: &str);
}

/// Drives a single accepted WebSocket to completion: performs the
/// hello/helloAck handshake, then runs the reader and writer halves
/// concurrently until either side closes.
pub async fn run(
    socket: WebSocket,
    port: u16,
    instance_id: String,
    correlator: Arc<Correlator>,
    events: Arc<dyn ConnectionEvents>,
    ping_interval: Duration,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    // Handshake: wait for `hello`, reply with `helloAck`.
    let hello_ok = matches!(
        stream.next().await,
        Some(Ok(Message::Text(text))) if matches!(serde_json::from_str::<IncomingMessage>(&text), Ok(IncomingMessage::Hello { .. }))
    );
    if !hello_ok {
        tracing::warn!(port, "connection closed before a valid hello frame");
        return;
    }
    let ack = OutgoingMessage::HelloAck { instance_id: instance_id.clone(), port };
    if sink.send(Message::Text(serde_json::to_string(&ack).unwrap())).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::channel::<OutgoingMessage>(64);
    let open = Arc::new(AtomicBool::new(true));
    let handle = ConnectionHandle {
        connection_id: connection_id.clone(),
        port,
        outgoing: tx.clone(),
        open: open.clone(),
        wire_ids: Arc::new(WireIdGenerator::new()),
    };

    tracing::info!(port, connection_id = %connection_id, "extension connection established");
    events.on_connected(handle.clone()).await;

    let writer_open = open.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode outgoing message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        writer_open.store(false, Ordering::Release);
    });

    let pinger_tx = tx.clone();
    let pinger = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ping_interval);
        loop {
            interval.tick().await;
            let ping = OutgoingMessage::Ping { timestamp: Utc::now().timestamp_millis() };
            if pinger_tx.send(ping).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, connection_id = %connection_id, "read error, closing connection");
                break;
            }
        };
        match serde_json::from_str::<IncomingMessage>(&text) {
            Ok(IncomingMessage::Response { wire_id, data, error, .. }) => {
                let result = match error {
                    Some(message) => Err(crate::error::BrokerError::ExtensionError(message)),
                    None => Ok(crate::envelope::ResponseData {
                        tab_id: data.as_ref().and_then(crate::envelope::extract_tab_id),
                        data: data.unwrap_or(serde_json::Value::Null),
                    }),
                };
                correlator.resolve(&connection_id, wire_id, result);
            }
            Ok(IncomingMessage::Event { session_id, name, payload }) => {
                events.on_event(session_id, name, payload).await;
            }
            Ok(IncomingMessage::Pong { .. }) => {}
            Ok(IncomingMessage::PortListRequest) => {
                events.on_port_list_request(&handle).await;
            }
            Ok(IncomingMessage::Hello { .. }) => {
                tracing::warn!(connection_id = %connection_id, "unexpected duplicate hello frame, ignoring");
            }
            Err(e) => {
                tracing::warn!(error = %e, raw = %text, "discarding unparseable frame from extension");
            }
        }
    }

    pinger.abort();
    open.store(false, Ordering::Release);
    drop(tx);
    let _ = writer.await;
    correlator.fail_connection(&connection_id);
    events.on_closed(port, &connection_id).await;
    tracing::info!(port, connection_id = %connection_id, "extension connection closed");
}
