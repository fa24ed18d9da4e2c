use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::header::{CONNECTION, HOST, UPGRADE};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, Uri};
use axum::response::Response;
use futures::{Stream, TryStreamExt};
use hyper_util::rt::TokioIo;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use domain::error::ProxyError;
use infrastructure::config::Options;
use ports::secondary::metrics_port::RequestMetrics;

/// Response header naming the upstream every proxied response came from.
pub const HEADER_UPSTREAM_ADDRESS: &str = "gap-upstream-address";

/// Headers that are connection-scoped and never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards sanitized requests to the single configured upstream.
///
/// REST traffic streams through a pooled client; WebSocket upgrades are
/// handshaked with a dedicated HTTP/1.1 client and bridged byte-for-byte.
/// The inbound path and query are reused verbatim, so percent-encoded
/// slashes reach the upstream unchanged.
pub struct UpstreamDispatcher {
    client: reqwest::Client,
    upgrade_client: reqwest::Client,
    upstream_origin: String,
    upstream_host: String,
    proxy_websockets: bool,
    inflight: Option<Arc<Semaphore>>,
    metrics: Arc<dyn RequestMetrics>,
}

impl UpstreamDispatcher {
    /// Build the dispatcher and its transports from validated options.
    ///
    /// Fails when the upstream CA bundle cannot be loaded or a client
    /// cannot be constructed, which aborts startup.
    pub fn new(options: &Options, metrics: Arc<dyn RequestMetrics>) -> anyhow::Result<Self> {
        let url = &options.upstream_url;
        let upstream_origin = url.origin().ascii_serialization();
        let upstream_host = url.authority().to_string();

        let client = base_client_builder(options)?.build().map_err(|e| {
            anyhow::anyhow!("failed to build upstream transport: {e}")
        })?;
        // Upgrades require HTTP/1.1 end to end; ALPN could otherwise settle
        // on h2 with a TLS upstream.
        let upgrade_client = base_client_builder(options)?
            .http1_only()
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build upgrade transport: {e}"))?;

        let inflight = (options.transport.max_conns_per_host > 0)
            .then(|| Arc::new(Semaphore::new(options.transport.max_conns_per_host)));

        info!(
            upstream = %upstream_origin,
            websockets = options.proxy_websockets,
            flush_interval = ?options.upstream_flush,
            max_conns_per_host = options.transport.max_conns_per_host,
            max_idle_conns = options.transport.max_idle_conns,
            max_idle_conns_per_host = options.transport.max_idle_conns_per_host,
            "upstream dispatcher ready"
        );

        Ok(Self {
            client,
            upgrade_client,
            upstream_origin,
            upstream_host,
            proxy_websockets: options.proxy_websockets,
            inflight,
            metrics,
        })
    }

    /// Dispatch one sanitized request and return the upstream's response.
    pub async fn dispatch(&self, req: Request<Body>) -> Result<Response, ProxyError> {
        if self.proxy_websockets && is_websocket_upgrade(&req) {
            self.dispatch_upgrade(req).await
        } else {
            self.dispatch_rest(req).await
        }
    }

    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        match &self.inflight {
            // The semaphore is never closed, acquire only fails after close.
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        }
    }

    async fn dispatch_rest(&self, req: Request<Body>) -> Result<Response, ProxyError> {
        let (parts, body) = req.into_parts();
        let url = upstream_url(&self.upstream_origin, &parts.uri);

        let mut headers = parts.headers;
        let has_body = headers.contains_key("content-length")
            || headers.contains_key("transfer-encoding");
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);

        let permit = self.acquire_slot().await;

        let mut builder = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers);
        if has_body {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = builder.send().await.map_err(|e| {
            self.metrics.record_upstream_error("connect");
            classify_send_error(e)
        })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let stream = upstream.bytes_stream().map_err(io::Error::other);
        let body = Body::from_stream(HeldStream {
            inner: Box::pin(stream),
            _permit: permit,
        });

        let mut response = Response::builder()
            .status(status)
            .body(body)
            .map_err(|e| ProxyError::Internal {
                message: format!("failed to assemble upstream response: {e}"),
            })?;
        *response.headers_mut() = response_headers;
        response
            .headers_mut()
            .insert(HEADER_UPSTREAM_ADDRESS, host_header_value(&self.upstream_host));
        Ok(response)
    }

    async fn dispatch_upgrade(&self, req: Request<Body>) -> Result<Response, ProxyError> {
        let url = upstream_url(&self.upstream_origin, req.uri());
        debug!(%url, "proxying websocket upgrade");

        let mut headers = req.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));

        // Taking the upgrade handle consumes the request; the connection is
        // handed over once both sides switched protocols.
        let client_upgrade = hyper::upgrade::on(req);

        let upstream = self
            .upgrade_client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                self.metrics.record_upstream_error("upgrade");
                classify_send_error(e)
            })?;

        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            // The upstream refused the upgrade; relay its answer unchanged.
            debug!(status = %upstream.status(), "upstream declined websocket upgrade");
            let status = upstream.status();
            let mut response_headers = upstream.headers().clone();
            strip_hop_by_hop(&mut response_headers);
            let body = Body::from_stream(upstream.bytes_stream().map_err(io::Error::other));
            let mut response = Response::builder().status(status).body(body).map_err(|e| {
                ProxyError::Internal {
                    message: format!("failed to assemble upstream response: {e}"),
                }
            })?;
            *response.headers_mut() = response_headers;
            response
                .headers_mut()
                .insert(HEADER_UPSTREAM_ADDRESS, host_header_value(&self.upstream_host));
            return Ok(response);
        }

        // Relay the upstream's 101 headers, including Sec-WebSocket-Accept.
        let mut response_builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in upstream.headers() {
            response_builder = response_builder.header(name, value);
        }

        let upstream_io = upstream.upgrade().await.map_err(|e| {
            self.metrics.record_upstream_error("upgrade");
            ProxyError::Internal {
                message: format!("upstream upgrade failed: {e}"),
            }
        })?;

        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            match client_upgrade.await {
                Ok(client_io) => {
                    let mut client_io = TokioIo::new(client_io);
                    let mut upstream_io = upstream_io;
                    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                        Ok((from_client, from_upstream)) => {
                            debug!(from_client, from_upstream, "websocket session ended");
                        }
                        Err(e) => {
                            debug!(error = %e, "websocket bridge closed with error");
                        }
                    }
                }
                Err(e) => {
                    metrics.record_upstream_error("upgrade");
                    error!(error = %e, "client connection upgrade failed");
                }
            }
        });

        let mut response = response_builder
            .body(Body::empty())
            .map_err(|e| ProxyError::Internal {
                message: format!("failed to assemble upgrade response: {e}"),
            })?;
        response
            .headers_mut()
            .insert(HEADER_UPSTREAM_ADDRESS, host_header_value(&self.upstream_host));
        Ok(response)
    }
}

/// Stream wrapper that holds the in-flight permit until the body finishes.
struct HeldStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Stream for HeldStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

fn base_client_builder(options: &Options) -> anyhow::Result<reqwest::ClientBuilder> {
    let transport = &options.transport;
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(transport.max_idle_conns_per_host)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy();

    if !transport.idle_conn_timeout.is_zero() {
        builder = builder.pool_idle_timeout(transport.idle_conn_timeout);
    }
    if !transport.tls_handshake_timeout.is_zero() {
        builder = builder.connect_timeout(transport.tls_handshake_timeout);
    }

    if options.ssl_insecure_skip_verify {
        warn!("upstream TLS verification is disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    for path in &options.upstream_cas {
        let pem = std::fs::read(path).map_err(|e| {
            anyhow::anyhow!("failed to read upstream CA '{}': {e}", path.display())
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            anyhow::anyhow!("invalid upstream CA '{}': {e}", path.display())
        })?;
        builder = builder.add_root_certificate(cert);
    }

    Ok(builder)
}

/// Join the upstream origin with the inbound path and query, verbatim.
/// No decoding or re-escaping happens, so encoded slashes survive.
fn upstream_url(origin: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{origin}{path_and_query}")
}

/// True when the request asks to switch protocols to websocket.
fn is_websocket_upgrade(req: &Request<Body>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    let upgrade_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket
}

/// Remove connection-scoped headers, including those the Connection header
/// names explicitly.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for token in named {
        headers.remove(token.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn classify_send_error(e: reqwest::Error) -> ProxyError {
    if e.is_connect() || e.is_timeout() {
        ProxyError::UpstreamUnreachable {
            message: e.to_string(),
        }
    } else {
        ProxyError::Internal {
            message: format!("upstream request failed: {e}"),
        }
    }
}

fn host_header_value(host: &str) -> HeaderValue {
    HeaderValue::from_str(host).unwrap_or_else(|_| HeaderValue::from_static("upstream"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::any;
    use infrastructure::config::{Options, RawOptions};
    use ports::test_utils::NoopMetrics;
    use std::path::PathBuf;

    fn options_for(upstream: &str) -> Options {
        Options::validate(RawOptions {
            elasticsearch_url: upstream.to_string(),
            tls_cert: Some(PathBuf::from("/etc/proxy/tls.crt")),
            tls_key: Some(PathBuf::from("/etc/proxy/tls.key")),
            ..RawOptions::default()
        })
        .unwrap()
    }

    fn dispatcher_for(upstream: &str) -> UpstreamDispatcher {
        UpstreamDispatcher::new(&options_for(upstream), Arc::new(NoopMetrics)).unwrap()
    }

    // ── URL building ─────────────────────────────────────────────────

    #[test]
    fn encoded_slashes_survive_url_building() {
        let uri: Uri = "/indices/a%2Fb/_search?q=%2Fx".parse().unwrap();
        assert_eq!(
            upstream_url("https://es:9200", &uri),
            "https://es:9200/indices/a%2Fb/_search?q=%2Fx"
        );
    }

    #[test]
    fn root_path_and_query_pass_through() {
        let uri: Uri = "/?pretty=true".parse().unwrap();
        assert_eq!(
            upstream_url("https://es:9200", &uri),
            "https://es:9200/?pretty=true"
        );
    }

    // ── Upgrade detection ────────────────────────────────────────────

    fn upgrade_request(connection: &str, upgrade: &str) -> Request<Body> {
        Request::builder()
            .uri("/ws")
            .header(CONNECTION, connection)
            .header(UPGRADE, upgrade)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn websocket_upgrade_is_detected() {
        assert!(is_websocket_upgrade(&upgrade_request("Upgrade", "websocket")));
        assert!(is_websocket_upgrade(&upgrade_request(
            "keep-alive, Upgrade",
            "WebSocket"
        )));
    }

    #[test]
    fn plain_requests_are_not_upgrades() {
        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        assert!(!is_websocket_upgrade(&req));
        assert!(!is_websocket_upgrade(&upgrade_request("Upgrade", "h2c")));
        let missing_connection = Request::builder()
            .uri("/x")
            .header(UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        assert!(!is_websocket_upgrade(&missing_connection));
    }

    // ── Hop-by-hop stripping ─────────────────────────────────────────

    #[test]
    fn fixed_hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-forwarded-user", "jdoe".parse().unwrap());

        strip_hop_by_hop(&mut headers);
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers["x-forwarded-user"], "jdoe");
    }

    #[test]
    fn connection_named_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "close, x-drop-me".parse().unwrap());
        headers.insert("x-drop-me", "1".parse().unwrap());
        headers.insert("x-keep-me", "1".parse().unwrap());

        strip_hop_by_hop(&mut headers);
        assert!(headers.get("x-drop-me").is_none());
        assert_eq!(headers["x-keep-me"], "1");
    }

    // ── End-to-end REST forwarding against a local upstream ──────────

    async fn echo_upstream() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        async fn echo(req: Request<Body>) -> Response {
            let path = req.uri().path().to_string();
            let user = req
                .headers()
                .get("x-forwarded-user")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            Response::builder()
                .status(StatusCode::OK)
                .header("x-seen-path", path)
                .header("x-seen-user", user)
                .body(Body::from("from-upstream"))
                .unwrap()
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(any(echo));
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn rest_request_reaches_the_upstream_with_trusted_headers() {
        let (addr, server) = echo_upstream().await;
        let dispatcher = dispatcher_for(&format!("http://{addr}"));

        let req = Request::builder()
            .uri("/x")
            .header("x-forwarded-user", "jdoe")
            .body(Body::empty())
            .unwrap();
        let resp = dispatcher.dispatch(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-seen-path"], "/x");
        assert_eq!(resp.headers()["x-seen-user"], "jdoe");
        assert_eq!(
            resp.headers()[HEADER_UPSTREAM_ADDRESS].to_str().unwrap(),
            addr.to_string()
        );

        server.abort();
    }

    #[tokio::test]
    async fn unreachable_upstream_maps_to_upstream_unreachable() {
        // Port 9 on localhost is vanishingly unlikely to accept.
        let dispatcher = dispatcher_for("http://127.0.0.1:9");

        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let err = dispatcher.dispatch(req).await.unwrap_err();
        assert!(
            matches!(err, ProxyError::UpstreamUnreachable { .. }),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn upgrade_requests_fall_through_to_rest_when_disabled() {
        let (addr, server) = echo_upstream().await;
        let options = Options::validate(RawOptions {
            elasticsearch_url: format!("http://{addr}"),
            proxy_websockets: false,
            tls_cert: Some(PathBuf::from("/etc/proxy/tls.crt")),
            tls_key: Some(PathBuf::from("/etc/proxy/tls.key")),
            ..RawOptions::default()
        })
        .unwrap();
        let dispatcher = UpstreamDispatcher::new(&options, Arc::new(NoopMetrics)).unwrap();

        let req = Request::builder()
            .uri("/ws")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        let resp = dispatcher.dispatch(req).await.unwrap();
        // The echo upstream answered over plain HTTP: no 101 involved.
        assert_eq!(resp.status(), StatusCode::OK);

        server.abort();
    }
}
