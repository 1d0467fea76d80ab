//! Reference extension-side harness
//!
//! A minimal stand-in for a real browser extension: scans the configured
//! port range, dials the first broker that answers, performs the
//! hello/helloAck handshake, answers pings with pongs, and replies to
//! every `command` envelope with a synthetic success response carrying a
//! fresh `tabId` the first time a session addresses it. Used to exercise
//! the broker end-to-end without a real browser attached.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const PORT_RANGE: std::ops::RangeInclusive<u16> = 8765..=8775;
const DIAL_TIMEOUT: Duration = Duration::from_millis(300);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("mock_extension=info").init();

    let (ws, url) = match find_broker().await {
        Some(found) => found,
        None => {
            tracing::error!("no broker answered in port range {:?}", PORT_RANGE);
            std::process::exit(1);
        }
    };
    tracing::info!(%url, "connected to broker");
    let (mut sink, mut stream) = ws.split();

    sink.send(Message::Text(json!({"type": "hello", "wants": "instanceId"}).to_string()))
        .await
        .expect("failed to send hello");

    let mut next_tab_id: i64 = 1;
    let mut session_tabs: HashMap<String, i64> = HashMap::new();

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "read error");
                break;
            }
        };

        let Ok(msg) = serde_json::from_str::<Value>(&text) else {
            tracing::warn!(raw = %text, "discarding unparseable frame");
            continue;
        };

        match msg["type"].as_str() {
            Some("helloAck") => {
                tracing::info!(instance_id = ?msg["instanceId"], port = ?msg["port"], "handshake complete");
            }
            Some("ping") => {
                let pong = json!({"type": "pong", "timestamp": msg["timestamp"]});
                let _ = sink.send(Message::Text(pong.to_string())).await;
            }
            Some("portListResponse") => {
                tracing::debug!(ports = ?msg["ports"], "received peer port list");
            }
            Some("command") => {
                let session_id = msg["sessionId"].as_str().unwrap_or_default().to_string();
                let wire_id = msg["wireId"].clone();
                let tab_id = msg["tabId"].as_i64().or_else(|| session_tabs.get(&session_id).copied()).unwrap_or_else(|| {
                    let id = next_tab_id;
                    next_tab_id += 1;
                    id
                });
                session_tabs.insert(session_id.clone(), tab_id);

                let response = json!({
                    "type": "response",
                    "wireId": wire_id,
                    "sessionId": session_id,
                    "data": {"tabId": tab_id, "ok": true, "echoedName": msg["name"]},
                });
                if sink.send(Message::Text(response.to_string())).await.is_err() {
                    break;
                }
            }
            other => {
                tracing::debug!(?other, "ignoring unhandled message type");
            }
        }
    }

    tracing::info!("disconnected from broker");
}

/// Scans the fixed port range and dials the first broker that accepts a
/// WebSocket upgrade.
async fn find_broker() -> Option<(tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, String)> {
    for port in PORT_RANGE {
        let url = format!("ws://127.0.0.1:{port}/");
        if let Ok(Ok((ws, _))) = tokio::time::timeout(DIAL_TIMEOUT, connect_async(&url)).await {
            return Some((ws, url));
        }
    }
    None
}
