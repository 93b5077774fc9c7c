//! Prometheus metrics endpoint.
//!
//! A single extract run is short lived, so the endpoint is opt-in and mainly
//! useful when runs are scraped by a sidecar or a push gateway bridge.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::error;

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder and serve `/metrics` and `/health` on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(serve(addr, handle));

    Ok(())
}

async fn serve(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(|| async { "ok\n" }))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics endpoint to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics endpoint error: {}", e);
    }
}

async fn render_metrics(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}
