// src/server/metrics_server.rs

use super::context::ServerContext;
use crate::core::metrics::{self, gather_metrics};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Weak;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
///
/// It refreshes the session gauge from the registry before gathering all
/// registered metrics and encoding them in the Prometheus text format.
async fn metrics_handler(ctx: Weak<ServerContext>) -> impl IntoResponse {
    if let Some(ctx) = ctx.upgrade() {
        metrics::CONNECTED_SESSIONS.set(ctx.registry.connected_count() as f64);
    }

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs a simple HTTP server to expose Prometheus metrics on /metrics.
pub async fn run_metrics_server(
    ctx: Weak<ServerContext>,
    port: u16,
    shutdown: CancellationToken,
) {
    let app = Router::new().route("/metrics", get(move || metrics_handler(ctx.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Metrics server shutting down.");
        })
        .await;
    if let Err(e) = served {
        error!("Metrics server failed: {}", e);
    }
}
