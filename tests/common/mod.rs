//! Shared harness for the end-to-end coordination scenarios: spins up a
//! real `Broker` (real file-backed port registry, real TCP/WebSocket
//! extension acceptor) and a scriptable mock extension client that dials
//! it the way a real browser extension would.

use browser_broker::config::BrokerConfig;
use browser_broker::Broker;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU16, Ordering};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

static NEXT_PORT: AtomicU16 = AtomicU16::new(19500);

/// Hands out a fresh single-port range per test so parallel `cargo test`
/// runs never fight over the same TCP port or registry entry.
pub fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

pub async fn start_broker(registry_path: std::path::PathBuf, port: u16) -> Broker {
    start_broker_in_range(registry_path, port..=port).await
}

/// Like [`start_broker`] but over a (possibly multi-port) range, so several
/// instances started against the same `registry_path` genuinely contend for
/// ports via `PortRegistry`'s file lock rather than each having its own
/// pre-reserved, already-distinct port.
pub async fn start_broker_in_range(registry_path: std::path::PathBuf, port_range: std::ops::RangeInclusive<u16>) -> Broker {
    let config = BrokerConfig {
        http_port: 0,
        port_range_start: *port_range.start(),
        port_range_end: *port_range.end(),
        registry_path: registry_path.to_string_lossy().into_owned(),
        command_timeout_secs: 5,
        lock_timeout_secs: 5,
        ping_interval_secs: 5,
        session_idle_secs: 600,
        stale_threshold_secs: 60,
        log_filter: "browser_broker=warn".into(),
    };
    Broker::start(&config).await.expect("broker should claim its port and start")
}

/// What a scripted mock extension does with one received `command` envelope.
pub enum Scripted {
    Success { tab_id: Option<i64>, data: Value },
    Error(String),
    /// Simulates the extension's socket dying mid-operation: the mock
    /// closes the connection without answering this command at all.
    DropConnection,
}

pub type Handler = Box<dyn FnMut(&Value) -> Scripted + Send>;

/// Dials `port`, performs the hello/helloAck handshake, then answers every
/// `command` envelope via `handler` until the socket closes.
pub async fn connect_mock_extension(port: u16, mut handler: Handler) {
    let url = format!("ws://127.0.0.1:{port}/");
    let (ws, _) = connect_async(&url).await.expect("mock extension should dial the broker");
    let (mut sink, mut stream) = ws.split();

    sink.send(Message::Text(json!({"type": "hello", "wants": "instanceId"}).to_string())).await.unwrap();
    let _ack = stream.next().await;

    tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            let Message::Text(text) = frame else { continue };
            let Ok(msg) = serde_json::from_str::<Value>(&text) else { continue };
            match msg["type"].as_str() {
                Some("ping") => {
                    let pong = json!({"type": "pong", "timestamp": msg["timestamp"]});
                    let _ = sink.send(Message::Text(pong.to_string())).await;
                }
                Some("command") => {
                    let wire_id = msg["wireId"].clone();
                    let session_id = msg["sessionId"].clone();
                    let response = match handler(&msg["payload"]) {
                        Scripted::Success { tab_id, data } => {
                            let mut data = data;
                            if let Some(t) = tab_id {
                                data["tabId"] = json!(t);
                            }
                            json!({"type": "response", "wireId": wire_id, "sessionId": session_id, "data": data})
                        }
                        Scripted::Error(message) => {
                            json!({"type": "response", "wireId": wire_id, "sessionId": session_id, "error": message})
                        }
                        Scripted::DropConnection => break,
                    };
                    if sink.send(Message::Text(response.to_string())).await.is_err() {
                        break;
                    }
                }
                _ => {}
            }
        }
    });
}

/// Polls the health snapshot until the extension's connection is visible,
/// since `connect_mock_extension` returns as soon as the dial succeeds, not
/// once the broker side has finished registering the handle.
pub async fn wait_for_connection(broker: &Broker) {
    for _ in 0..100 {
        if broker.health.snapshot().connection_count >= 1 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("mock extension never registered with the broker");
}
