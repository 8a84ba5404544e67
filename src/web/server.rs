use std::sync::Arc;
use axum::{
    Router,
    extract::State,
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::WebConfig;
use crate::metrics::{self, ProxyMetrics};
use crate::registry::DomainRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DomainRegistry>,
    pub metrics: Arc<ProxyMetrics>,
    /// `address:port` of the proxy listener, shown by /info
    pub proxy_addr: String,
}

/// Internal endpoints. Served in-band for self-addressed requests on the proxy
/// port and, when enabled, on the admin listener.
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info_banner))
        .route("/api/registry", get(api_registry))
        .route("/api/stats", get(api_stats))
        .route("/metrics", get(prometheus))
        .with_state(state)
}

/// Standalone admin listener for the internal endpoints
pub struct WebServer {
    state: AppState,
    config: WebConfig,
}

impl WebServer {
    pub fn new(state: AppState, config: WebConfig) -> Self {
        Self { state, config }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("Admin listener disabled");
            return Ok(());
        }

        let app = internal_router(self.state.clone()).layer(CorsLayer::permissive());

        let addr = format!("{}:{}", self.config.address, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Admin endpoints listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        Ok(())
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn info_banner(State(state): State<AppState>) -> String {
    format!(
        "xproxy v{} on {}: {} domain(s) routed, {} unresolved\n",
        env!("CARGO_PKG_VERSION"),
        state.proxy_addr,
        state.registry.len(),
        state.registry.unresolved_domains().len()
    )
}

/// Registry snapshot: every domain with its candidates, plus the unresolved set
async fn api_registry(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.registry.to_json())
}

async fn api_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.metrics.get_stats())
}

async fn prometheus(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(&state.metrics, &state.registry),
    )
}
