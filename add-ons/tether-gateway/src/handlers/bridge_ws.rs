//! GET /bridge/connect: upgrades to a WebSocket and serves the bridge protocol.

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;
use std::sync::Arc;
use tether_bridge::serve_connection;
use tracing::info;

use crate::{identity, ws_transport, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Unauthenticated sockets are still upgraded so they receive the error envelope.
    let identity = identity::resolve(&state.config, &headers, query.token.as_deref());
    let registry = Arc::clone(&state.registry);
    let reconciler = Arc::clone(&state.reconciler);
    ws.on_upgrade(move |socket| async move {
        let (source, sink) = ws_transport::split(socket);
        let exit = serve_connection(registry, reconciler, identity, source, sink).await;
        info!(?exit, "bridge socket finished");
    })
}
