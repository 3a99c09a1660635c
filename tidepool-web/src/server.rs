//! HTTP server for the Tidepool API
//!
//! Builds the router over a shared `FileService` and serves it until the
//! shutdown signal fires.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tidepool_core::FileService;
use tower_http::cors::CorsLayer;

use crate::handlers::{api_delete_file, api_download_file, api_file_info, api_stats, api_upload_file};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// File store behind the API
    pub service: Arc<FileService>,
    /// When the server started
    pub server_started_at: std::time::Instant,
}

impl AppState {
    /// Wraps a service for use by the router.
    pub fn new(service: Arc<FileService>) -> Self {
        Self {
            service,
            server_started_at: std::time::Instant::now(),
        }
    }
}

/// Builds the API router.
///
/// The request body limit is disabled; the file service enforces the upload
/// size cap while streaming.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/files", post(api_upload_file))
        .route("/api/files/{id}", delete(api_delete_file))
        .route("/api/files/{id}/download", get(api_download_file))
        .route("/api/files/{id}/info", get(api_file_info))
        .route("/api/stats", get(api_stats))
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API on `addr` until `shutdown` completes.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the address cannot be bound or serving fails
pub async fn run_server(
    service: Arc<FileService>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(AppState::new(service));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Tidepool listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("Tidepool server stopped");
    Ok(())
}
