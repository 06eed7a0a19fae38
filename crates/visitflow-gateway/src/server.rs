use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use visitflow_core::config::GatewayConfig;

use crate::routes;
use crate::state::AppState;

/// All HTTP routes over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        // Server actions
        .route("/api/v1/workflows/execution/action", post(routes::execute_action))
        // Analytics
        .route("/api/v1/workflows/analytics/track", post(routes::track_event))
        .route("/api/v1/workflows/analytics/track/batch", post(routes::track_batch))
        .route(
            "/api/v1/workflows/analytics/funnel/{workflow_id}",
            get(routes::workflow_funnel),
        )
        .route(
            "/api/v1/workflows/analytics/workflow/{workflow_id}",
            get(routes::workflow_summary),
        )
        // Workflows & signals
        .route("/api/v1/workflows/site/{site_id}/active", get(routes::active_workflows))
        .route("/api/v1/signals", post(routes::ingest_signal))
        .route(
            "/api/v1/visitor/{site_id}/{visitor_id}/has-tag",
            get(routes::has_tag),
        )
        .route("/api/v1/dlq", get(routes::list_dlq))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
