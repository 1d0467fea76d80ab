//! Unified broker error taxonomy
//!
//! Every component gets its own narrow error enum; this module translates
//! them into a client-facing taxonomy and the structured result shape
//! returned to the AI client.

use serde::Serialize;
use thiserror::Error;

/// Top-level error returned by the dispatcher to a calling tool-RPC layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no extension attached to this session")]
    NoConnection,

    #[error("session has no usable tab")]
    NoConnectedTab,

    #[error("request timed out waiting for a response")]
    MessageTimeout,

    #[error("failed to send envelope: {0}")]
    SendError(String),

    #[error("extension connection closed")]
    ConnectionClosed,

    #[error("extension reported an error: {0}")]
    ExtensionError(String),

    #[error("exceeded retry budget after {attempts} attempt(s): {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("timed out waiting to acquire tab lock")]
    LockAcquireTimeout,

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("no free ports available in the configured range")]
    NoPortsAvailable,
}

impl BrokerError {
    /// Classification used by the retry engine and error taxonomy.
    ///
    /// `ExtensionError` is pattern-classified separately by `crate::retry`;
    /// treat it as non-retryable here unless already wrapped by that logic.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::NoConnection
            | BrokerError::NoConnectedTab
            | BrokerError::MessageTimeout
            | BrokerError::SendError(_)
            | BrokerError::ConnectionClosed => true,
            BrokerError::ExtensionError(msg) => crate::retry::classify_extension_error(msg).is_retryable(),
            BrokerError::MaxRetriesExceeded { .. }
            | BrokerError::LockAcquireTimeout
            | BrokerError::Cancelled(_)
            | BrokerError::NoPortsAvailable => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::NoConnection => "NoConnection",
            BrokerError::NoConnectedTab => "NoConnectedTab",
            BrokerError::MessageTimeout => "MessageTimeout",
            BrokerError::SendError(_) => "SendError",
            BrokerError::ConnectionClosed => "ConnectionClosed",
            BrokerError::ExtensionError(_) => "ExtensionError",
            BrokerError::MaxRetriesExceeded { .. } => "MaxRetriesExceeded",
            BrokerError::LockAcquireTimeout => "LockAcquireTimeout",
            BrokerError::Cancelled(_) => "Cancelled",
            BrokerError::NoPortsAvailable => "NoPortsAvailable",
        }
    }
}

/// Structured, uniform result shape surfaced to the AI client.
#[derive(Debug, Serialize)]
pub struct ClientErrorBody {
    pub kind: &'static str,
    pub retryable: bool,
    pub details: String,
    pub attempts: u32,
    pub last_seen_context: Option<serde_json::Value>,
}

impl ClientErrorBody {
    pub fn from_error(err: &BrokerError, attempts: u32, last_seen_context: Option<serde_json::Value>) -> Self {
        Self {
            kind: err.kind(),
            retryable: err.is_retryable(),
            details: err.to_string(),
            attempts,
            last_seen_context,
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
