use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::routing::get;
use tokio_rustls::rustls::ServerConfig;
use tracing::info;

use infrastructure::config::ServerTimeouts;
use infrastructure::metrics::ProxyMetrics;

use super::tls::TlsListener;

/// Content-Type for `OpenMetrics` text exposition format.
const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves Prometheus metrics in `OpenMetrics` text format.
async fn metrics(
    State(metrics): State<Arc<ProxyMetrics>>,
) -> ([(header::HeaderName, &'static str); 1], String) {
    let body = metrics.encode();
    ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body)
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn build_metrics_router(metrics: Arc<ProxyMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(self::metrics))
        .route("/healthz", get(healthz))
        .with_state(metrics)
}

/// Run the metrics HTTPS listener until `shutdown` resolves.
///
/// Separate TLS material from the main listener, no client auth, no
/// connection timeouts beyond keep-alive.
pub async fn run_metrics_server(
    metrics: Arc<ProxyMetrics>,
    listening_address: &str,
    tls_config: Arc<ServerConfig>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listening_address).await?;
    info!(address = %listening_address, "HTTPS metrics listening");

    let timeouts = ServerTimeouts {
        read: std::time::Duration::ZERO,
        write: std::time::Duration::ZERO,
        idle: std::time::Duration::ZERO,
    };
    let tls_listener = TlsListener::new(listener, tls_config, timeouts);
    axum::serve(tls_listener, build_metrics_router(metrics))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
