//! Per-port acceptor loop
//!
//! Each claimed port in the range runs its own tiny axum app whose only
//! route upgrades to a WebSocket and hands the socket to
//! [`connection::run`]. `SO_REUSEADDR` is set explicitly (via `socket2`)
//! so a just-restarted broker can rebind a port before the OS has fully
//! reaped the previous listener's TIME_WAIT sockets.

use super::connection::{self, ConnectionEvents};
use crate::correlator::Correlator;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use socket2::{Domain, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
struct PortState {
    port: u16,
    instance_id: String,
    correlator: Arc<Correlator>,
    events: Arc<dyn ConnectionEvents>,
    ping_interval: Duration,
}

async fn upgrade_handler(State(state): State<PortState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        connection::run(socket, state.port, state.instance_id, state.correlator, state.events, state.ping_interval).await;
    })
}

fn bind_reusable(port: u16) -> std::io::Result<StdTcpListener> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Runs the acceptor for a single port until the listener errors out or
/// the process shuts down. Intended to be spawned once per claimed port.
pub async fn serve_extension_port(
    port: u16,
    instance_id: String,
    correlator: Arc<Correlator>,
    events: Arc<dyn ConnectionEvents>,
    shutdown: tokio::sync::watch::Receiver<bool>,
    ping_interval: Duration,
) -> std::io::Result<()> {
    let std_listener = bind_reusable(port)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;

    let state = PortState { port, instance_id, correlator, events, ping_interval };
    let app = Router::new().route("/", get(upgrade_handler)).with_state(state);

    tracing::info!(port, "extension acceptor listening");

    let mut shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
