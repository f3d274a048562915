//! HTTP handlers: the bridge WebSocket, REST management and the event stream.

pub mod bridge_api;
pub mod bridge_ws;
pub mod events;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tether_core::{BridgeError, Identity};

use crate::{identity, AppState};

/// JSON error body `{ "error": ... }` with a status derived from the bridge error.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Missing or invalid bearer token")
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let status = match &err {
            BridgeError::Validation(_) => StatusCode::BAD_REQUEST,
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::DuplicateClient(_) => StatusCode::CONFLICT,
            BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::ToolFailed(_)
            | BridgeError::CommandFailed(_)
            | BridgeError::ConnectionClosed
            | BridgeError::Transport(_) => StatusCode::BAD_GATEWAY,
            BridgeError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub(crate) fn require_identity(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    identity::resolve(&state.config, headers, None).ok_or_else(ApiError::unauthorized)
}
