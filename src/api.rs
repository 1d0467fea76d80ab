//! AI-client-facing RPC surface
//!
//! Deliberately thin: building the real JSON-RPC tool-catalog framing is
//! out of scope here, so this is the minimal contract the dispatcher
//! needs driven over HTTP — a single `POST /rpc` entry point plus the
//! supplemented health/supervision endpoints.

use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::envelope::TabId;
use crate::error::ClientErrorBody;
use crate::health::HealthSupervisor;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const SESSION_HEADER: &str = "x-broker-session-id";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub health: Arc<HealthSupervisor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/sessions/:id", axum::routing::delete(destroy_session_handler))
        .route("/healthz", get(healthz_handler))
        .route("/debug/snapshot", get(snapshot_handler))
        .with_state(state)
}

#[derive(Deserialize)]
struct RpcRequest {
    name: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "tabId", default)]
    tab_id: Option<TabId>,
}

#[derive(Serialize)]
struct RpcResponse {
    data: Value,
    #[serde(rename = "tabId", skip_serializing_if = "Option::is_none")]
    tab_id: Option<TabId>,
    attempts: u32,
}

async fn rpc_handler(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<RpcRequest>) -> Response {
    let session_id = match headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("missing required {SESSION_HEADER} header")})),
            )
                .into_response();
        }
    };

    let result = state
        .dispatcher
        .dispatch(DispatchRequest {
            session_id,
            command_name: body.name,
            payload: body.payload,
            tab_id: body.tab_id,
        })
        .await;

    match result {
        Ok(outcome) => {
            Json(RpcResponse { data: outcome.data, tab_id: outcome.tab_id, attempts: outcome.attempts }).into_response()
        }
        Err(err) => {
            let attempts = match &err {
                crate::error::BrokerError::MaxRetriesExceeded { attempts, .. } => *attempts,
                _ => 1,
            };
            let body = ClientErrorBody::from_error(&err, attempts, None);
            let status = if err.is_retryable() { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::BAD_REQUEST };
            (status, Json(body)).into_response()
        }
    }
}

async fn destroy_session_handler(State(state): State<AppState>, axum::extract::Path(id): axum::extract::Path<String>) -> StatusCode {
    state.dispatcher.destroy_session(&id);
    StatusCode::NO_CONTENT
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.is_healthy() {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"status": "unhealthy"})))
    }
}

async fn snapshot_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.snapshot())
}
