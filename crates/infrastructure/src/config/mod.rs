//! Proxy configuration: options, parsing, and validation.
//!
//! The binary's CLI layer collects raw flag values into [`RawOptions`];
//! [`Options::validate`] turns them into the frozen runtime configuration,
//! reporting every problem at once. After validation the options are
//! immutable — readable by all, writable by none.

mod common;
mod roles;

pub use common::{ConfigError, LogFormat, LogLevel};
pub use roles::{parse_backend_role, parse_backend_roles};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use domain::identity::entity::SarTemplate;

use crate::constants::{
    DEFAULT_CACHE_EXPIRY, DEFAULT_CACHE_SIZE, DEFAULT_EXPECT_CONTINUE_TIMEOUT,
    DEFAULT_IDLE_CONN_TIMEOUT, DEFAULT_LISTENING_ADDRESS, DEFAULT_MAX_IDLE_CONNS_PER_HOST,
    DEFAULT_TLS_HANDSHAKE_TIMEOUT, DEFAULT_UPSTREAM_FLUSH, DEFAULT_UPSTREAM_URL,
};

// ── Raw flag values ────────────────────────────────────────────────

/// Flag values exactly as collected by the CLI, before validation.
#[derive(Debug, Clone)]
pub struct RawOptions {
    pub listening_address: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_client_ca: Option<PathBuf>,

    pub metrics_listening_address: Option<String>,
    pub metrics_tls_cert: Option<PathBuf>,
    pub metrics_tls_key: Option<PathBuf>,

    pub elasticsearch_url: String,
    pub upstream_cas: Vec<PathBuf>,
    pub upstream_flush: Duration,
    pub ssl_insecure_skip_verify: bool,
    pub proxy_websockets: bool,

    pub cache_expiry: Duration,
    pub cache_size: u64,

    pub raw_backend_roles: Vec<String>,
    pub whitelisted_names: Vec<String>,
    pub admin_role: Option<String>,
    pub default_role: Option<String>,

    pub openshift_cas: Vec<PathBuf>,
    pub request_logging: bool,

    pub http_read_timeout: Duration,
    pub http_write_timeout: Duration,
    pub http_idle_timeout: Duration,
    pub http_max_conns_per_host: usize,
    pub http_max_idle_conns: usize,
    pub http_max_idle_conns_per_host: usize,
    pub http_idle_conn_timeout: Duration,
    pub http_tls_handshake_timeout: Duration,
    pub http_expect_continue_timeout: Duration,
}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            listening_address: DEFAULT_LISTENING_ADDRESS.to_string(),
            tls_cert: None,
            tls_key: None,
            tls_client_ca: None,
            metrics_listening_address: None,
            metrics_tls_cert: None,
            metrics_tls_key: None,
            elasticsearch_url: DEFAULT_UPSTREAM_URL.to_string(),
            upstream_cas: Vec::new(),
            upstream_flush: DEFAULT_UPSTREAM_FLUSH,
            ssl_insecure_skip_verify: false,
            proxy_websockets: true,
            cache_expiry: DEFAULT_CACHE_EXPIRY,
            cache_size: DEFAULT_CACHE_SIZE,
            raw_backend_roles: Vec::new(),
            whitelisted_names: Vec::new(),
            admin_role: None,
            default_role: None,
            openshift_cas: Vec::new(),
            request_logging: false,
            http_read_timeout: Duration::ZERO,
            http_write_timeout: Duration::ZERO,
            http_idle_timeout: Duration::ZERO,
            http_max_conns_per_host: 0,
            http_max_idle_conns: 0,
            http_max_idle_conns_per_host: DEFAULT_MAX_IDLE_CONNS_PER_HOST,
            http_idle_conn_timeout: DEFAULT_IDLE_CONN_TIMEOUT,
            http_tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            http_expect_continue_timeout: DEFAULT_EXPECT_CONTINUE_TIMEOUT,
        }
    }
}

// ── Validated options ──────────────────────────────────────────────

/// TLS material for one listener.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// The optional metrics listener: address plus its own TLS material.
#[derive(Debug, Clone)]
pub struct MetricsOptions {
    pub listening_address: String,
    pub tls: TlsMaterial,
}

/// Per-connection server timeouts. `ZERO` disables a bound.
#[derive(Debug, Clone, Copy)]
pub struct ServerTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
}

/// Upstream transport pool settings. Counts of `0` mean unlimited.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub max_conns_per_host: usize,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub expect_continue_timeout: Duration,
}

/// Validated, frozen runtime configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub listening_address: String,
    pub tls: TlsMaterial,
    pub tls_client_ca: Option<PathBuf>,

    pub metrics: Option<MetricsOptions>,

    pub upstream_url: Url,
    pub upstream_cas: Vec<PathBuf>,
    pub upstream_flush: Duration,
    pub ssl_insecure_skip_verify: bool,
    pub proxy_websockets: bool,

    pub cache_expiry: Duration,
    pub cache_size: u64,

    pub backend_roles: BTreeMap<String, SarTemplate>,
    pub whitelisted_names: Vec<String>,
    pub admin_role: Option<String>,
    pub default_role: Option<String>,

    pub openshift_cas: Vec<PathBuf>,
    pub request_logging: bool,

    pub server_timeouts: ServerTimeouts,
    pub transport: TransportOptions,
}

impl Options {
    /// Validate raw flag values into frozen options, collecting every
    /// failure message before reporting.
    pub fn validate(raw: RawOptions) -> Result<Self, ConfigError> {
        let mut msgs: Vec<String> = Vec::new();

        if raw.listening_address.is_empty() {
            msgs.push("missing setting: listening-address".to_string());
        }

        let upstream_url = parse_upstream_url(&raw.elasticsearch_url, &mut msgs);

        let (tls_cert, tls_key) = match (raw.tls_cert, raw.tls_key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                msgs.push("tls-cert and tls-key are required to listen on tls".to_string());
                (PathBuf::new(), PathBuf::new())
            }
        };

        let metrics = match (
            raw.metrics_listening_address,
            raw.metrics_tls_cert,
            raw.metrics_tls_key,
        ) {
            (None, None, None) => None,
            (Some(addr), Some(cert), Some(key)) => Some(MetricsOptions {
                listening_address: addr,
                tls: TlsMaterial { cert, key },
            }),
            _ => {
                msgs.push(
                    "metrics-listening-address, metrics-tls-cert, and metrics-tls-key \
                     must be set together"
                        .to_string(),
                );
                None
            }
        };

        let backend_roles = parse_backend_roles(&raw.raw_backend_roles, &mut msgs);

        let whitelisted_names: Vec<String> = raw
            .whitelisted_names
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();

        if !msgs.is_empty() {
            return Err(ConfigError::Invalid { messages: msgs });
        }

        Ok(Self {
            listening_address: raw.listening_address,
            tls: TlsMaterial {
                cert: tls_cert,
                key: tls_key,
            },
            tls_client_ca: raw.tls_client_ca,
            metrics,
            // parse_upstream_url pushed a message on failure, and messages
            // were just checked.
            upstream_url: upstream_url.expect("validated above"),
            upstream_cas: raw.upstream_cas,
            upstream_flush: raw.upstream_flush,
            ssl_insecure_skip_verify: raw.ssl_insecure_skip_verify,
            proxy_websockets: raw.proxy_websockets,
            cache_expiry: raw.cache_expiry,
            cache_size: raw.cache_size,
            backend_roles,
            whitelisted_names,
            admin_role: normalize(raw.admin_role),
            default_role: normalize(raw.default_role),
            openshift_cas: raw.openshift_cas,
            request_logging: raw.request_logging,
            server_timeouts: ServerTimeouts {
                read: raw.http_read_timeout,
                write: raw.http_write_timeout,
                idle: raw.http_idle_timeout,
            },
            transport: TransportOptions {
                max_conns_per_host: raw.http_max_conns_per_host,
                max_idle_conns: raw.http_max_idle_conns,
                max_idle_conns_per_host: raw.http_max_idle_conns_per_host,
                idle_conn_timeout: raw.http_idle_conn_timeout,
                tls_handshake_timeout: raw.http_tls_handshake_timeout,
                expect_continue_timeout: raw.http_expect_continue_timeout,
            },
        })
    }

    /// The path prefix requests must carry, taken from the upstream URL.
    pub fn mount_path(&self) -> &str {
        self.upstream_url.path()
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_upstream_url(raw: &str, msgs: &mut Vec<String>) -> Option<Url> {
    if raw.is_empty() {
        msgs.push("missing setting: elasticsearch-url".to_string());
        return None;
    }
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(url) => {
            msgs.push(format!(
                "unsupported upstream scheme {:?} in {raw:?}: expected http or https",
                url.scheme()
            ));
            None
        }
        Err(e) => {
            msgs.push(format!("error parsing elasticsearch-url {raw:?}: {e}"));
            None
        }
    }
}
