use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use super::tls::TlsConnectInfo;

/// Per-request access log line, enabled by `--request-logging`.
///
/// Emitted to stdout through the logging subscriber under the `access`
/// target, after the response is produced.
pub async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote = req
        .extensions()
        .get::<ConnectInfo<TlsConnectInfo>>()
        .map(|info| info.0.remote_addr.to_string())
        .unwrap_or_default();
    let started = Instant::now();

    let response = next.run(req).await;

    info!(
        target: "access",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        remote = %remote,
        duration_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}
