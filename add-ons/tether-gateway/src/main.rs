//! tether-gateway: HTTP/WebSocket front door for client bridges.
//!
//! Loads `.env`, then `BridgeConfig` (file + `TETHER__*` environment), opens
//! the sled vault and serves the bridge endpoint plus the REST/SSE surface.
//! `--write-config [path]` writes the effective configuration and exits.

mod handlers;
mod identity;
mod ws_transport;

use axum::http::Method;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use tether_bridge::{ConnectionRegistry, StateReconciler};
use tether_core::{BridgeConfig, EventBus, Notifier, SledVault};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<BridgeConfig>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) reconciler: Arc<StateReconciler>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) vault: Arc<SledVault>,
}

impl AppState {
    pub(crate) fn new(config: BridgeConfig, vault: Arc<SledVault>) -> Self {
        let events = Arc::new(EventBus::new());
        let registry = ConnectionRegistry::new(config.link_settings())
            .with_notifier(events.clone() as Arc<dyn Notifier>)
            .with_audit(vault.clone());
        let reconciler = StateReconciler::new(vault.clone(), vault.clone()).with_sessions(vault.clone());
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            reconciler: Arc::new(reconciler),
            events,
            vault,
        }
    }
}

fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::bridge_api::health))
        .route("/bridge/connect", get(handlers::bridge_ws::connect))
        .route("/api/bridge/status", get(handlers::bridge_api::status))
        .route("/api/bridge/tools", get(handlers::bridge_api::tools))
        .route("/api/bridge/tools/:name/execute", post(handlers::bridge_api::execute_tool))
        .route(
            "/api/bridge/servers",
            get(handlers::bridge_api::list_servers).post(handlers::bridge_api::add_server),
        )
        .route(
            "/api/bridge/servers/:name",
            put(handlers::bridge_api::toggle_server).delete(handlers::bridge_api::remove_server),
        )
        .route("/api/bridge/sync", post(handlers::bridge_api::request_sync))
        .route("/api/bridge/events", get(handlers::events::stream))
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[tether-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match BridgeConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let args: Vec<String> = std::env::args().collect();
    if let Some(pos) = args.iter().position(|a| a == "--write-config") {
        let path = args
            .get(pos + 1)
            .cloned()
            .unwrap_or_else(|| "config/bridge.toml".to_string());
        match config.save_to_path(std::path::Path::new(&path)) {
            Ok(()) => {
                println!("Configuration written to {}", path);
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Failed to write configuration: {}", e);
                std::process::exit(1);
            }
        }
    }

    if config.tokens.is_empty() {
        warn!("no bearer tokens configured; every bridge connection will be rejected");
    }

    let vault = match SledVault::open_path(config.vault_path()) {
        Ok(vault) => Arc::new(vault),
        Err(e) => {
            error!(error = %e, path = %config.vault_path().display(), "failed to open vault");
            std::process::exit(1);
        }
    };

    let addr = config.bind_addr();
    let state = AppState::new(config, vault);
    let app = build_app(state.clone());

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, app = %state.config.app_name, "tether gateway listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }

    let closed = state.registry.disconnect_all();
    info!(closed, "bridges closed");
    if let Err(e) = state.vault.flush() {
        warn!(error = %e, "vault flush failed");
    }
}
