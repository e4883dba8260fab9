use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use weft_core::config::GatewayConfig;
use weft_engine::Engine;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway in front of an [`Engine`], built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Engine,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Engine) -> Self {
        Self { config, engine }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = router(self.engine.clone());

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

pub(crate) fn router(engine: Engine) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/api/health", get(routes::health))
        // Chains and schemas
        .route("/api/chains/validate", post(routes::validate_chain))
        .route("/api/compatibility", post(routes::compatibility))
        // Runs
        .route("/api/runs", get(routes::list_runs).post(routes::submit_run))
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/transforms", get(routes::run_transforms))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        // Generative confirmations
        .route("/api/confirmations", get(routes::list_confirmations))
        .route("/api/confirmations/{id}", post(routes::answer_confirmation))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
