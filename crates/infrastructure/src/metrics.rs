use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use ports::secondary::metrics_port::{ControlPlaneMetrics, IdentityCacheMetrics, RequestMetrics};

// ── Label types ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub code: u32,
    pub handler: String,
    pub method: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HandlerMethodLabels {
    pub handler: String,
    pub method: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CallLabels {
    pub call: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

/// Latency buckets spanning fast cache hits through slow upstream queries.
fn request_duration_buckets() -> Histogram {
    Histogram::new(
        [
            0.001, 0.01, 0.1, 0.3, 0.6, 1.0, 3.0, 6.0, 9.0, 20.0, 30.0, 60.0, 90.0, 120.0,
        ]
        .into_iter(),
    )
}

// ── Proxy metrics registry ──────────────────────────────────────────

/// Prometheus metrics registry for the proxy.
///
/// All metric families use interior mutability (atomics), so recording
/// only requires `&self`. The registry itself is not `Clone` — wrap in
/// `Arc` for multi-task sharing.
pub struct ProxyMetrics {
    registry: Registry,
    pub http_requests_total: Family<RequestLabels, Counter>,
    pub http_request_duration_seconds: Family<HandlerMethodLabels, Histogram>,
    pub identity_cache_hits_total: Counter,
    pub identity_cache_misses_total: Counter,
    pub identity_loads_total: Family<OutcomeLabels, Counter>,
    pub control_plane_requests_total: Family<CallLabels, Counter>,
    pub upstream_errors_total: Family<KindLabels, Counter>,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("searchgate");

        let http_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "http_requests",
            "HTTP requests handled by the proxy",
            http_requests_total.clone(),
        );

        let http_request_duration_seconds =
            Family::<HandlerMethodLabels, Histogram>::new_with_constructor(
                request_duration_buckets,
            );
        registry.register(
            "http_request_duration_seconds",
            "Latency of proxied HTTP requests",
            http_request_duration_seconds.clone(),
        );

        let identity_cache_hits_total = Counter::default();
        registry.register(
            "identity_cache_hits",
            "Identity cache lookups answered from memory",
            identity_cache_hits_total.clone(),
        );

        let identity_cache_misses_total = Counter::default();
        registry.register(
            "identity_cache_misses",
            "Identity cache lookups that started a resolver load",
            identity_cache_misses_total.clone(),
        );

        let identity_loads_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "identity_loads",
            "Finished identity resolver loads by outcome",
            identity_loads_total.clone(),
        );

        let control_plane_requests_total = Family::<CallLabels, Counter>::default();
        registry.register(
            "control_plane_requests",
            "Control plane API calls by endpoint and outcome",
            control_plane_requests_total.clone(),
        );

        let upstream_errors_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "upstream_errors",
            "Upstream dispatch failures by kind",
            upstream_errors_total.clone(),
        );

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            identity_cache_hits_total,
            identity_cache_misses_total,
            identity_loads_total,
            control_plane_requests_total,
            upstream_errors_total,
        }
    }

    /// Encode the registry in OpenMetrics text format.
    pub fn encode(&self) -> String {
        let mut body = String::new();
        // Encoding only fails on fmt::Write, which String never does.
        let _ = prometheus_client::encoding::text::encode(&mut body, &self.registry);
        body
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMetrics for ProxyMetrics {
    fn record_request(&self, code: u16, handler: &str, method: &str) {
        self.http_requests_total
            .get_or_create(&RequestLabels {
                code: u32::from(code),
                handler: handler.to_string(),
                method: method.to_string(),
            })
            .inc();
    }

    fn observe_request_duration(&self, handler: &str, method: &str, duration_seconds: f64) {
        self.http_request_duration_seconds
            .get_or_create(&HandlerMethodLabels {
                handler: handler.to_string(),
                method: method.to_string(),
            })
            .observe(duration_seconds);
    }

    fn record_upstream_error(&self, kind: &str) {
        self.upstream_errors_total
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}

impl IdentityCacheMetrics for ProxyMetrics {
    fn record_cache_hit(&self) {
        self.identity_cache_hits_total.inc();
    }

    fn record_cache_miss(&self) {
        self.identity_cache_misses_total.inc();
    }

    fn record_identity_load(&self, outcome: &str) {
        self.identity_loads_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }
}

impl ControlPlaneMetrics for ProxyMetrics {
    fn record_control_plane_call(&self, call: &str, outcome: &str) {
        self.control_plane_requests_total
            .get_or_create(&CallLabels {
                call: call.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }
}
