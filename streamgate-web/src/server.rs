//! HTTP server wiring for the gateway.
//!
//! Builds the shared application state from configuration, assembles the
//! router, and serves it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use streamgate_core::config::GatewayConfig;
use streamgate_core::cookies::{ChannelBus, CookieStore};
use streamgate_core::estimate::{HttpLengthProbe, LengthProbe};
use streamgate_core::tunnel::{TunnelRegistry, UpstreamRegistry, proxy_client};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::handlers::{create_tunnel, health};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Gateway configuration the server was started with.
    pub config: GatewayConfig,
    /// Rotating per-service cookie store.
    pub store: Arc<CookieStore>,
    /// Upstream connection tracking.
    pub registry: Arc<dyn UpstreamRegistry>,
    /// HTTP client shared by the proxy path and the length probe.
    pub client: reqwest::Client,
    /// Length probe for `Estimated-Content-Length`.
    pub probe: Arc<dyn LengthProbe>,
    /// Server start time, for the health endpoint.
    pub started_at: Instant,
}

impl AppState {
    /// Builds production state from configuration, loading the cookie
    /// file when one is configured.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Cookie` - Cookie file could not be loaded
    /// - `GatewayError::Tunnel` - HTTP client could not be constructed
    pub fn from_config(config: GatewayConfig) -> streamgate_core::Result<Self> {
        let store = if config.cluster.enabled {
            CookieStore::with_cluster(Arc::new(ChannelBus::new()), config.cluster.primary)
        } else {
            CookieStore::new()
        };
        let store = Arc::new(store.with_flush_interval(config.cookies.flush_interval));
        if let Some(path) = &config.cookies.path {
            store.load(path)?;
            info!(path = %path.display(), "cookie store loaded");
        }

        let client = proxy_client(&config.network)?;
        let probe = Arc::new(HttpLengthProbe::new(
            client.clone(),
            config.network.probe_timeout,
        ));

        Ok(Self {
            store,
            registry: Arc::new(TunnelRegistry::new()),
            client,
            probe,
            started_at: Instant::now(),
            config,
        })
    }
}

/// Assembles the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tunnel", post(create_tunnel))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the gateway server until the listener fails.
///
/// # Errors
///
/// Returns an error when state construction, binding, or serving fails.
pub async fn run_server(
    config: GatewayConfig,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
