//! REST surface over the caller's bridge: status, tools, server management,
//! tool execution and sync requests.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tether_core::ServerCommand;

use super::{require_identity, ApiError};
use crate::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "app": state.config.app_name,
        "connections": state.registry.connection_count(),
    }))
}

/// GET /api/bridge/status
pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    let identity = require_identity(&state, &headers)?;
    let summary = state.registry.connection_summary(&identity.user_id);
    Ok(Json(json!({
        "connected": summary.is_some(),
        "connection": summary,
    })))
}

/// GET /api/bridge/tools – tools offered by the caller's client, grouped by category.
pub async fn tools(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    let identity = require_identity(&state, &headers)?;
    let catalog = state.registry.tool_catalog(&identity.user_id);
    let count: usize = catalog.values().map(Vec::len).sum();
    Ok(Json(json!({ "count": count, "categories": catalog })))
}

/// GET /api/bridge/servers – tool servers configured on the caller's client.
pub async fn list_servers(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    let identity = require_identity(&state, &headers)?;
    let servers = state.registry.user_servers(&identity.user_id)?;
    Ok(Json(json!({ "servers": servers })))
}

#[derive(Debug, Deserialize)]
pub struct AddServerRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// POST /api/bridge/servers
pub async fn add_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AddServerRequest>,
) -> Result<Json<Value>, ApiError> {
    let identity = require_identity(&state, &headers)?;
    if body.name.trim().is_empty() || body.command.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "name and command are required"));
    }
    let command = ServerCommand::AddServer {
        name: body.name,
        description: body.description,
        command: body.command,
        args: body.args,
    };
    run_command(&state, &identity.user_id, command).await
}

#[derive(Debug, Deserialize)]
pub struct ToggleServerRequest {
    pub enabled: bool,
}

/// PUT /api/bridge/servers/:name
pub async fn toggle_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<ToggleServerRequest>,
) -> Result<Json<Value>, ApiError> {
    let identity = require_identity(&state, &headers)?;
    let command = ServerCommand::ToggleServer {
        name,
        enabled: body.enabled,
    };
    run_command(&state, &identity.user_id, command).await
}

/// DELETE /api/bridge/servers/:name
pub async fn remove_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let identity = require_identity(&state, &headers)?;
    run_command(&state, &identity.user_id, ServerCommand::RemoveServer { name }).await
}

async fn run_command(state: &AppState, user_id: &str, command: ServerCommand) -> Result<Json<Value>, ApiError> {
    let action = command.name();
    let server = command.server_name().to_string();
    state.registry.send_server_command(user_id, command).await?;
    Ok(Json(json!({ "success": true, "action": action, "server": server })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub arguments: Value,
    pub timeout_secs: Option<u64>,
}

/// POST /api/bridge/tools/:name/execute
pub async fn execute_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    let identity = require_identity(&state, &headers)?;
    let timeout = body.timeout_secs.map(Duration::from_secs);
    let result = state
        .registry
        .execute_tool(&identity.user_id, &name, body.arguments, timeout)
        .await?;
    Ok(Json(json!({ "tool": name, "result": result })))
}

/// POST /api/bridge/sync – asks the caller's client to re-send its state.
pub async fn request_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let identity = require_identity(&state, &headers)?;
    if !state.registry.is_user_connected(&identity.user_id) {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "no bridge client connected"));
    }
    state.registry.request_sync(&identity.user_id);
    Ok((StatusCode::ACCEPTED, Json(json!({ "requested": true }))))
}
