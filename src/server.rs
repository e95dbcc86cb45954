//! HTTP endpoint serving the exposition registry to pull-based scrapers.

use crate::report::Exposition;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub fn router(exposition: Arc<Exposition>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(exposition)
}

async fn metrics(State(exposition): State<Arc<Exposition>>) -> Response {
    match exposition.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics").into_response()
        }
    }
}

/// Serve `/metrics` on an already bound listener until the token is cancelled
pub async fn serve(
    listener: TcpListener,
    exposition: Arc<Exposition>,
    token: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("Prometheus metrics available at http://{}/metrics", addr);

    axum::serve(listener, router(exposition))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("Metrics server failed")
}
