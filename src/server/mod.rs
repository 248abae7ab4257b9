pub mod auth;
pub mod envelope;
pub mod handlers;
pub mod routes;

use tokio::sync::broadcast;
use tracing::info;

use crate::error::{Result, SentinelError};

pub use routes::AppState;

/// Bind and serve the API until the shutdown signal fires.
pub async fn serve(state: AppState, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let bind_addr = state.config.bind_addr.clone();
    let router = routes::build(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| SentinelError::Config(format!("failed to bind {bind_addr}: {e}")))?;
    info!(addr = %bind_addr, "API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("HTTP server shutting down");
        })
        .await
        .map_err(SentinelError::Io)?;
    Ok(())
}
