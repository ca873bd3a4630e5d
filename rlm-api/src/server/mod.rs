//! API Server Module
//!
//! Bootstraps the axum router for the RLM HTTP surface (§6.1) and owns the
//! shared `ApiState`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{assemble, health_check, run, ApiState};

pub struct ApiServer {
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(state: ApiState) -> Self {
        Self { state: Arc::new(state) }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/v1/rlm/assemble", post(assemble))
            .route("/v1/rlm/run", post(run))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Binds and serves until the process is terminated.
    pub async fn start(&self) -> Result<()> {
        let host = self.state.config.http_host.clone();
        let port = self.state.config.http_port;
        let addr: SocketAddr = format!("{host}:{port}").parse()?;

        info!(%addr, "starting RLM pipeline API server");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .await
            .map_err(|e| anyhow::anyhow!("API server terminated: {e}"))?;
        Ok(())
    }
}
