//! Broker configuration
//!
//! Typed environment configuration, in the same `std::env::var`
//! fallback style as a single-port read but promoted to a `clap`-derived
//! struct since this service carries many more knobs.

use clap::Parser;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "browser-broker", about = "Multi-session browser automation broker")]
pub struct BrokerConfig {
    /// HTTP port for the AI-client-facing RPC surface.
    #[arg(long, env = "BROKER_HTTP_PORT", default_value_t = 8900)]
    pub http_port: u16,

    /// Fixed extension-port range, inclusive.
    #[arg(long, env = "BROKER_PORT_RANGE_START", default_value_t = 8765)]
    pub port_range_start: u16,

    #[arg(long, env = "BROKER_PORT_RANGE_END", default_value_t = 8775)]
    pub port_range_end: u16,

    /// Path to the shared port-registry file.
    #[arg(long, env = "BROKER_REGISTRY_PATH", default_value = "/tmp/browser-broker/ports.json")]
    pub registry_path: String,

    /// Default per-request command timeout, in seconds.
    #[arg(long, env = "BROKER_COMMAND_TIMEOUT_SECS", default_value_t = 30)]
    pub command_timeout_secs: u64,

    /// Default tab-lock acquire timeout, in seconds.
    #[arg(long, env = "BROKER_LOCK_TIMEOUT_SECS", default_value_t = 30)]
    pub lock_timeout_secs: u64,

    /// Extension-connection ping-keepalive interval, in seconds.
    #[arg(long, env = "BROKER_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Session idle timeout, in seconds; should be at least ten minutes
    /// in production to tolerate normal think-time between commands.
    #[arg(long, env = "BROKER_SESSION_IDLE_SECS", default_value_t = 600)]
    pub session_idle_secs: u64,

    /// Stale tab-lock / registry-entry threshold, in seconds.
    #[arg(long, env = "BROKER_STALE_THRESHOLD_SECS", default_value_t = 60)]
    pub stale_threshold_secs: u64,

    /// Log level / filter directive, mirroring `RUST_LOG`.
    #[arg(long, env = "BROKER_LOG", default_value = "browser_broker=info,tower_http=debug")]
    pub log_filter: String,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self::parse()
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn port_range(&self) -> std::ops::RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            http_port: 8900,
            port_range_start: 8765,
            port_range_end: 8775,
            registry_path: "/tmp/browser-broker/ports.json".to_string(),
            command_timeout_secs: 30,
            lock_timeout_secs: 30,
            ping_interval_secs: 30,
            session_idle_secs: 600,
            stale_threshold_secs: 60,
            log_filter: "browser_broker=info,tower_http=debug".to_string(),
        }
    }
}
