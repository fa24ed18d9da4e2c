use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use tokio_rustls::rustls::ServerConfig;
use tracing::{info, warn};

use infrastructure::config::ServerTimeouts;

use super::access_log::access_log;
use super::error::structured_response;
use super::state::ProxyState;
use super::tls::{TlsConnectInfo, TlsListener};

/// Build the proxy router: every method on every path runs the pipeline and
/// then the dispatcher.
pub fn build_router(state: Arc<ProxyState>, request_logging: bool) -> Router {
    let router = Router::new().fallback(proxy_entry).with_state(state);
    if request_logging {
        router.layer(middleware::from_fn(access_log))
    } else {
        router
    }
}

async fn proxy_entry(State(state): State<Arc<ProxyState>>, req: Request<Body>) -> Response {
    let started = Instant::now();
    let method = req.method().as_str().to_string();

    if !req.uri().path().starts_with(&state.mount_path) {
        state.metrics.record_request(404, "mux", &method);
        return StatusCode::NOT_FOUND.into_response();
    }

    let (handler, response) = match state.pipeline.run(req).await {
        Ok(req) => match state.dispatcher.dispatch(req).await {
            Ok(response) => ("proxy", response),
            Err(err) => {
                warn!(error = %err, "upstream dispatch failed");
                ("proxy", structured_response(&err))
            }
        },
        Err(failure) => {
            warn!(
                handler = failure.handler,
                error = %failure.error,
                "request rejected by pipeline"
            );
            (failure.handler, structured_response(&failure.error))
        }
    };

    state
        .metrics
        .record_request(response.status().as_u16(), handler, &method);
    state
        .metrics
        .observe_request_duration(handler, &method, started.elapsed().as_secs_f64());
    response
}

/// Run the main HTTPS listener until `shutdown` resolves, draining
/// in-flight connections before returning.
pub async fn run_proxy_server(
    state: Arc<ProxyState>,
    listening_address: &str,
    tls_config: Arc<ServerConfig>,
    timeouts: ServerTimeouts,
    request_logging: bool,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listening_address).await?;
    info!(address = %listening_address, "HTTPS proxy listening");

    let tls_listener = TlsListener::new(listener, tls_config, timeouts);
    let app = build_router(state, request_logging);
    axum::serve(
        tls_listener,
        app.into_make_service_with_connect_info::<TlsConnectInfo>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
