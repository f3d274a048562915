//! Bearer-token identity source backed by the configured token map.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use tether_core::{BridgeConfig, Identity};

const AUTH_TYPE: &str = "bearer";

/// Resolves the caller from `Authorization: Bearer <token>`, falling back to
/// a `token` query parameter (browsers cannot set headers on WebSocket upgrades).
pub fn resolve(config: &BridgeConfig, headers: &HeaderMap, query_token: Option<&str>) -> Option<Identity> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .or_else(|| query_token.map(str::trim))
        .filter(|t| !t.is_empty())?;
    config
        .tokens
        .get(token)
        .map(|user_id| Identity::new(user_id.clone(), AUTH_TYPE))
}
