//! browser-broker binary entry point
//!
//! Loads configuration, starts the broker (port claim, extension
//! acceptor, background sweeps), serves the AI-client-facing RPC surface
//! until a shutdown signal arrives, then drains cleanly.

use browser_broker::config::BrokerConfig;
use browser_broker::Broker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BrokerConfig::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_current_span(false).with_span_list(false))
        .init();

    let broker = Broker::start(&config).await?;
    tracing::info!(instance_id = %broker.instance_id, port = broker.extension_port, "starting browser-broker");

    let http_port = config.http_port;
    tokio::select! {
        result = broker.serve_http(http_port) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server exited with error");
            }
        }
        () = wait_for_shutdown_signal() => {}
    }

    broker.shutdown().await;
    Ok(())
}

/// Waits for SIGINT or SIGTERM so shutdown drains tab locks and extension
/// sockets cleanly rather than terminating mid-request.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received ctrl-c, shutting down");
    }
}
