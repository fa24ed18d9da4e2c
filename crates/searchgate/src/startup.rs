use std::sync::Arc;

use tracing::{error, info};

use adapters::http::authorization::AuthorizationHandler;
use adapters::http::dispatch::UpstreamDispatcher;
use adapters::http::metrics_server::run_metrics_server;
use adapters::http::pipeline::HandlerChain;
use adapters::http::server::run_proxy_server;
use adapters::http::state::ProxyState;
use adapters::http::tls::load_server_config;
use adapters::kube::KubeControlPlane;
use application::identity_cache::IdentityCache;
use application::identity_resolver::IdentityResolver;
use infrastructure::config::Options;
use infrastructure::constants::GRACEFUL_SHUTDOWN_TIMEOUT;
use infrastructure::logging::init_logging;
use infrastructure::metrics::ProxyMetrics;
use ports::secondary::metrics_port::{ControlPlaneMetrics, IdentityCacheMetrics, MetricsPort, RequestMetrics};

use crate::cli::Cli;

/// Run the proxy startup sequence and block until shutdown.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    // ── 1. Validate options ─────────────────────────────────────────
    let options = Options::validate(cli.to_raw_options())?;

    // ── 2. Initialize logging ───────────────────────────────────────
    init_logging(cli.log_level, cli.log_format);

    // Service root span — fields appear in every subsequent log entry
    let _root_span = tracing::span!(
        tracing::Level::INFO,
        "service",
        service.name = "searchgate",
        service.version = env!("CARGO_PKG_VERSION"),
    )
    .entered();

    info!(
        listening_address = %options.listening_address,
        upstream = %options.upstream_url,
        mount_path = options.mount_path(),
        backend_roles = options.backend_roles.len(),
        cache_size = options.cache_size,
        cache_expiry = ?options.cache_expiry,
        "searchgate starting"
    );
    if !options.transport.expect_continue_timeout.is_zero() {
        tracing::debug!(
            expect_continue_timeout = ?options.transport.expect_continue_timeout,
            "expect-continue handling is not implemented by the upstream transport"
        );
    }

    // ── 3. Initialize metrics ───────────────────────────────────────
    let metrics = Arc::new(ProxyMetrics::new());

    // ── 4. Control-plane client ─────────────────────────────────────
    let control_plane_metrics: Arc<dyn ControlPlaneMetrics> =
        metrics.clone();
    let control_plane = Arc::new(
        KubeControlPlane::new(&options.openshift_cas, control_plane_metrics).await?,
    );

    // ── 5. Identity cache over the resolver ─────────────────────────
    let resolver = IdentityResolver::new(control_plane, options.backend_roles.clone());
    let identity_cache_metrics: Arc<dyn IdentityCacheMetrics> =
        metrics.clone();
    let cache = Arc::new(IdentityCache::new(
        resolver,
        options.cache_size,
        options.cache_expiry,
        identity_cache_metrics,
    ));

    // ── 6. Pipeline, dispatcher, shared state ───────────────────────
    let authorization = AuthorizationHandler::new(
        cache,
        options.backend_roles.keys().cloned().collect(),
        options.admin_role.clone(),
        options.default_role.clone(),
        options.whitelisted_names.clone(),
    );
    let request_metrics: Arc<dyn RequestMetrics> =
        metrics.clone();
    let dispatcher = UpstreamDispatcher::new(&options, request_metrics)?;
    let metrics_port: Arc<dyn MetricsPort> =
        metrics.clone();
    let state = Arc::new(ProxyState::new(
        HandlerChain::new(vec![Box::new(authorization)]),
        dispatcher,
        options.mount_path().to_string(),
        metrics_port,
    ));

    // ── 7. TLS material (fatal on bad files) ────────────────────────
    let tls_config = load_server_config(
        &options.tls.cert,
        &options.tls.key,
        options.tls_client_ca.as_deref(),
    )?;
    let metrics_tls = options
        .metrics
        .as_ref()
        .map(|m| load_server_config(&m.tls.cert, &m.tls.key, None))
        .transpose()?;

    // ── 8. Shutdown token ───────────────────────────────────────────
    let cancel_token = crate::shutdown::create_shutdown_token();

    // ── 9. Spawn the main HTTPS listener ────────────────────────────
    let http_handle = {
        let state = Arc::clone(&state);
        let address = options.listening_address.clone();
        let timeouts = options.server_timeouts;
        let request_logging = options.request_logging;
        let shutdown = cancel_token.clone();
        let on_failure = cancel_token.clone();
        tokio::spawn(async move {
            let result = run_proxy_server(
                state,
                &address,
                tls_config,
                timeouts,
                request_logging,
                shutdown.cancelled_owned(),
            )
            .await;
            if let Err(ref e) = result {
                error!(error = %e, "HTTPS proxy server failed");
                on_failure.cancel();
            }
            result
        })
    };

    // ── 10. Spawn the metrics listener when configured ──────────────
    let metrics_handle = match (&options.metrics, metrics_tls) {
        (Some(metrics_options), Some(tls)) => {
            let registry = metrics.clone();
            let address = metrics_options.listening_address.clone();
            let shutdown = cancel_token.clone();
            let on_failure = cancel_token.clone();
            Some(tokio::spawn(async move {
                let result =
                    run_metrics_server(registry, &address, tls, shutdown.cancelled_owned()).await;
                if let Err(ref e) = result {
                    error!(error = %e, "HTTPS metrics server failed");
                    on_failure.cancel();
                }
                result
            }))
        }
        _ => None,
    };

    // ── 11. Ready — wait for cancellation ───────────────────────────
    info!("proxy ready, waiting for shutdown signal");
    cancel_token.cancelled().await;

    // ── 12. Drain listeners ─────────────────────────────────────────
    info!("shutdown: draining connections");
    propagate(tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, http_handle).await)?;
    if let Some(handle) = metrics_handle {
        propagate(tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle).await)?;
    }

    info!("searchgate stopped");
    Ok(())
}

/// Surface a listener failure as the process exit status; drain timeouts
/// and join errors on shutdown are expected and ignored.
fn propagate(
    joined: Result<Result<anyhow::Result<()>, tokio::task::JoinError>, tokio::time::error::Elapsed>,
) -> anyhow::Result<()> {
    match joined {
        Ok(Ok(result)) => result,
        _ => Ok(()),
    }
}
