//! HTTP API for the analyst agent.
//!
//! Endpoints:
//! - `POST /api/analyze`: run a task (raw text or multipart upload)
//! - `POST /api/feedback`: rate a past interaction
//! - `POST /api/context`: add knowledge-base snippets
//! - `GET /api/stats`: learning metrics
//! - `GET /api/health` and `GET /`: liveness

mod error;
mod handlers;
mod routes;

pub use error::ApiError;
pub use routes::create_router;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Settings;
use crate::services::Analyst;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub analyst: Arc<Analyst>,
    /// Maximum request body size in bytes.
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            analyst: Arc::new(Analyst::from_settings(settings)?),
            max_upload_bytes: settings.server.max_upload_bytes,
        })
    }
}

/// Start the web server and run until Ctrl-C.
pub async fn serve(settings: &Settings, host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState::new(settings)?;
    let app = create_router(state);

    let listener = TcpListener::bind((host, port)).await?;
    info!("Starting server at http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
