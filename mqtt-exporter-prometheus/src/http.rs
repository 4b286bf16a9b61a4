//! HTTP server for the Prometheus scrape, health and readiness endpoints.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::ingest::SharedIngest;

/// Prometheus text exposition format, version 0.0.4.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    ingest: SharedIngest,
}

/// Create the HTTP router.
fn create_router(ingest: SharedIngest, metrics_path: &str) -> Router {
    let state = AppState { ingest };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the /metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.ingest.render();

    (
        StatusCode::OK,
        [("content-type", CONTENT_TYPE)],
        body,
    )
        .into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler(State(state): State<AppState>) -> Response {
    // Ready once the broker has delivered at least one message.
    if state.ingest.stats().messages_received > 0 {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no messages received yet\n",
        )
            .into_response()
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    ingest: SharedIngest,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(ingest: SharedIngest, listen_addr: SocketAddr, metrics_path: String) -> Self {
        Self {
            ingest,
            listen_addr,
            metrics_path,
        }
    }

    /// Bind the listening socket without serving yet.
    pub async fn bind(self) -> anyhow::Result<BoundHttpServer> {
        info!(
            addr = %self.listen_addr,
            path = %self.metrics_path,
            "Starting HTTP server"
        );

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        Ok(BoundHttpServer {
            router: create_router(self.ingest, &self.metrics_path),
            listener,
            metrics_path: self.metrics_path,
        })
    }

    /// Bind and serve until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.bind().await?.serve(shutdown).await
    }
}

/// An HTTP server with its socket bound.
pub struct BoundHttpServer {
    router: Router,
    listener: TcpListener,
    metrics_path: String,
}

impl BoundHttpServer {
    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until the shutdown signal is received.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            addr = %self.local_addr()?,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                // A dropped sender also means shutdown
                let _ = shutdown.wait_for(|stop| *stop).await;
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
