//! browser-broker core library
//!
//! The multi-session routing and coordination layer: port registry,
//! envelope codec, request correlator, retry engine, extension transport,
//! session registry, tab-lock scheduler, dispatcher, and supervision.
//! `main.rs` is a thin binary entry point over [`run`]; `tests/` exercises
//! the coordination scenarios against an in-process instance built the
//! same way.

pub mod api;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod events;
pub mod health;
pub mod lock;
pub mod registry;
pub mod retry;
pub mod session;
pub mod transport;

use config::BrokerConfig;
use correlator::Correlator;
use dispatcher::Dispatcher;
use events::BrokerEvents;
use health::HealthSupervisor;
use lock::TabLockScheduler;
use registry::PortRegistry;
use session::SessionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use transport::ConnectionHub;

/// Everything wired together for one running broker instance, returned so
/// callers (both `main` and integration tests) can reach into it directly
/// rather than only through the HTTP surface.
pub struct Broker {
    pub instance_id: String,
    pub extension_port: u16,
    pub dispatcher: Arc<Dispatcher>,
    pub health: Arc<HealthSupervisor>,
    pub sessions: Arc<SessionRegistry>,
    pub locks: Arc<TabLockScheduler>,
    pub correlator: Arc<Correlator>,
    pub port_registry: Arc<PortRegistry>,
    shutdown_tx: watch::Sender<bool>,
    extension_acceptor: tokio::task::JoinHandle<()>,
}

impl Broker {
    /// Claims a port, starts the extension acceptor and background
    /// sweeps, and returns the assembled instance.
    pub async fn start(config: &BrokerConfig) -> error::BrokerResult<Self> {
        let instance_id = uuid::Uuid::new_v4().to_string();

        let port_registry = Arc::new(PortRegistry::new(&config.registry_path, config.port_range(), config.stale_threshold()));
        let extension_port = port_registry.claim_port(&instance_id, std::process::id())?;

        let sessions = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionHub::new());
        let correlator = Arc::new(Correlator::new());
        let locks = Arc::new(TabLockScheduler::new());

        let health = Arc::new(HealthSupervisor::new(
            port_registry.clone(),
            sessions.clone(),
            connections.clone(),
            correlator.clone(),
            instance_id.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            sessions.clone(),
            connections.clone(),
            correlator.clone(),
            locks.clone(),
            config.command_timeout(),
            config.lock_timeout(),
            config.stale_threshold(),
            retry::default_max_retries(),
            extension_port,
        ));

        let events: Arc<dyn transport::ConnectionEvents> = Arc::new(BrokerEvents::new(connections.clone(), health.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let extension_acceptor = {
            let correlator = correlator.clone();
            let events = events.clone();
            let instance_id = instance_id.clone();
            let ping_interval = config.ping_interval();
            tokio::spawn(async move {
                if let Err(e) =
                    transport::serve_extension_port(extension_port, instance_id, correlator, events, shutdown_rx, ping_interval).await
                {
                    tracing::error!(error = %e, "extension acceptor exited with error");
                }
            })
        };

        tokio::spawn(run_heartbeat(port_registry.clone(), instance_id.clone()));
        tokio::spawn(run_idle_reaper(dispatcher.clone(), config.session_idle()));

        Ok(Self {
            instance_id,
            extension_port,
            dispatcher,
            health,
            sessions,
            locks,
            correlator,
            port_registry,
            shutdown_tx,
            extension_acceptor,
        })
    }

    /// Builds the axum router for the AI-client-facing RPC and health
    /// surface, CORS-permissive the way a locally-run broker needs to be
    /// for a browser-extension-adjacent tool to reach it.
    pub fn router(&self) -> axum::Router {
        let state = api::AppState { dispatcher: self.dispatcher.clone(), health: self.health.clone() };
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
        api::router(state).layer(cors)
    }

    pub async fn serve_http(&self, http_port: u16) -> std::io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "client RPC surface listening");
        axum::serve(listener, self.router()).await
    }

    /// Runs the graceful shutdown sequence: signals the extension
    /// acceptor to stop, drains sessions/locks/pending-requests, and
    /// releases this instance's port-registry entry.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.extension_acceptor.abort();
        health::drain(&self.sessions, &self.locks, &self.correlator, &self.port_registry, &self.instance_id).await;
    }
}

async fn run_idle_reaper(dispatcher: Arc<Dispatcher>, idle_timeout: std::time::Duration) {
    let idle_timeout = chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::seconds(600));
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        interval.tick().await;
        let drained = dispatcher.sessions().mark_idle_sessions_draining(idle_timeout);
        for session_id in drained {
            tracing::info!(session_id = %session_id, "reaping idle session");
            dispatcher.destroy_session(&session_id);
        }
    }
}

async fn run_heartbeat(registry: Arc<PortRegistry>, instance_id: String) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = registry.heartbeat(&instance_id) {
            tracing::warn!(error = %e, "port-registry heartbeat failed");
        }
    }
}
