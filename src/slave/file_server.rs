//! Serves the slave's working directory so the master can fetch outputs.

use std::path::Path;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

pub fn router(work_dir: &Path) -> Router {
    Router::new().fallback_service(ServeDir::new(work_dir))
}

pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "File server listening");
    }
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "File server failed");
    }
}
