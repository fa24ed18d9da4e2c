use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use infrastructure::config::{LogFormat, LogLevel, RawOptions};
use infrastructure::constants::{
    DEFAULT_CACHE_SIZE, DEFAULT_LISTENING_ADDRESS, DEFAULT_MAX_IDLE_CONNS_PER_HOST,
    DEFAULT_UPSTREAM_URL,
};

#[derive(Parser, Debug)]
#[command(
    name = "searchgate",
    about = "Authenticating reverse proxy for an Elasticsearch-compatible cluster",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// <addr>:<port> to listen on for HTTPS clients
    #[arg(long, default_value = DEFAULT_LISTENING_ADDRESS)]
    pub listening_address: String,

    /// Path to the server certificate file
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Path to the server private key file
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Path to a CA file for admitting client certificates
    #[arg(long)]
    pub tls_client_ca: Option<PathBuf>,

    /// <addr>:<port> for the metrics listener (requires metrics TLS material)
    #[arg(long)]
    pub metrics_listening_address: Option<String>,

    /// Path to the metrics listener certificate file
    #[arg(long)]
    pub metrics_tls_cert: Option<PathBuf>,

    /// Path to the metrics listener private key file
    #[arg(long)]
    pub metrics_tls_key: Option<PathBuf>,

    /// URL of the upstream cluster
    #[arg(long, default_value = DEFAULT_UPSTREAM_URL)]
    pub elasticsearch_url: String,

    /// Path to a CA root for the upstream server (may be given multiple
    /// times, defaults to the system trust store)
    #[arg(long = "upstream-ca")]
    pub upstream_ca: Vec<PathBuf>,

    /// Force flush upstream responses after this duration, 0 to never
    /// force flush
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5ms")]
    pub upstream_flush: Duration,

    /// Skip validation of certificates presented by the upstream
    #[arg(long)]
    pub ssl_insecure_skip_verify: bool,

    /// Enables WebSocket proxying
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub proxy_websockets: bool,

    /// Identity cache TTL; cached token resolutions are reused this long
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub cache_expiry: Duration,

    /// Identity cache capacity in tokens
    #[arg(long, default_value_t = DEFAULT_CACHE_SIZE)]
    pub cache_size: u64,

    /// A SAR to check to allow the given backend role, as name={json}
    /// (e.g. admin={"namespace":"default","verb":"get","resource":"pods/log"});
    /// may be given multiple times
    #[arg(long = "auth-backend-role")]
    pub auth_backend_role: Vec<String>,

    /// Certificate subject (CN or full RFC 2253 form) that bypasses
    /// authentication; may be given multiple times
    #[arg(long = "auth-whitelisted-name")]
    pub auth_whitelisted_name: Vec<String>,

    /// Backend role that, when granted, replaces all other roles
    #[arg(long)]
    pub auth_admin_role: Option<String>,

    /// Backend role granted when no other backend role matched
    #[arg(long)]
    pub auth_default_role: Option<String>,

    /// Path to a CA root for the control-plane API (may be given multiple
    /// times, defaults to the mounted service-account CA)
    #[arg(long = "openshift-ca")]
    pub openshift_ca: Vec<PathBuf>,

    /// Log requests to stdout
    #[arg(long)]
    pub request_logging: bool,

    /// Server read timeout, 0 disables
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub http_read_timeout: Duration,

    /// Server write timeout, 0 disables
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub http_write_timeout: Duration,

    /// Server idle timeout, 0 disables
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub http_idle_timeout: Duration,

    /// Bound on concurrent upstream requests, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    pub http_max_conns_per_host: usize,

    /// Bound on total idle upstream connections, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    pub http_max_idle_conns: usize,

    /// Idle upstream connections kept per host
    #[arg(long, default_value_t = DEFAULT_MAX_IDLE_CONNS_PER_HOST)]
    pub http_max_idle_conns_per_host: usize,

    /// How long idle upstream connections are kept
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    pub http_idle_conn_timeout: Duration,

    /// Bound on upstream connect and TLS handshake
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub http_tls_handshake_timeout: Duration,

    /// How long to wait for a 100-continue answer from the upstream
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    pub http_expect_continue_timeout: Duration,

    /// Log level (trace|debug|info|warn|error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log format: json (production) or text (development)
    #[arg(long, default_value = "json")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Raw flag values for validation; logging settings stay on the CLI.
    pub fn to_raw_options(&self) -> RawOptions {
        RawOptions {
            listening_address: self.listening_address.clone(),
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            tls_client_ca: self.tls_client_ca.clone(),
            metrics_listening_address: self.metrics_listening_address.clone(),
            metrics_tls_cert: self.metrics_tls_cert.clone(),
            metrics_tls_key: self.metrics_tls_key.clone(),
            elasticsearch_url: self.elasticsearch_url.clone(),
            upstream_cas: self.upstream_ca.clone(),
            upstream_flush: self.upstream_flush,
            ssl_insecure_skip_verify: self.ssl_insecure_skip_verify,
            proxy_websockets: self.proxy_websockets,
            cache_expiry: self.cache_expiry,
            cache_size: self.cache_size,
            raw_backend_roles: self.auth_backend_role.clone(),
            whitelisted_names: self.auth_whitelisted_name.clone(),
            admin_role: self.auth_admin_role.clone(),
            default_role: self.auth_default_role.clone(),
            openshift_cas: self.openshift_ca.clone(),
            request_logging: self.request_logging,
            http_read_timeout: self.http_read_timeout,
            http_write_timeout: self.http_write_timeout,
            http_idle_timeout: self.http_idle_timeout,
            http_max_conns_per_host: self.http_max_conns_per_host,
            http_max_idle_conns: self.http_max_idle_conns,
            http_max_idle_conns_per_host: self.http_max_idle_conns_per_host,
            http_idle_conn_timeout: self.http_idle_conn_timeout,
            http_tls_handshake_timeout: self.http_tls_handshake_timeout,
            http_expect_continue_timeout: self.http_expect_continue_timeout,
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_the_documented_invocation() {
        let cli = Cli::try_parse_from(["searchgate"]).unwrap();
        assert_eq!(cli.listening_address, DEFAULT_LISTENING_ADDRESS);
        assert_eq!(cli.elasticsearch_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(cli.upstream_flush, Duration::from_millis(5));
        assert_eq!(cli.cache_expiry, Duration::from_secs(300));
        assert_eq!(cli.cache_size, DEFAULT_CACHE_SIZE);
        assert!(cli.proxy_websockets);
        assert!(!cli.ssl_insecure_skip_verify);
        assert!(!cli.request_logging);
        assert_eq!(cli.http_read_timeout, Duration::ZERO);
        assert_eq!(
            cli.http_max_idle_conns_per_host,
            DEFAULT_MAX_IDLE_CONNS_PER_HOST
        );
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn durations_parse_human_readable_values() {
        let cli = Cli::try_parse_from([
            "searchgate",
            "--cache-expiry",
            "90s",
            "--upstream-flush",
            "0s",
            "--http-idle-conn-timeout",
            "2m",
        ])
        .unwrap();
        assert_eq!(cli.cache_expiry, Duration::from_secs(90));
        assert_eq!(cli.upstream_flush, Duration::ZERO);
        assert_eq!(cli.http_idle_conn_timeout, Duration::from_secs(120));
    }

    #[test]
    fn invalid_duration_is_rejected() {
        assert!(Cli::try_parse_from(["searchgate", "--cache-expiry", "banana"]).is_err());
    }

    #[test]
    fn websockets_can_be_disabled() {
        let cli = Cli::try_parse_from(["searchgate", "--proxy-websockets", "false"]).unwrap();
        assert!(!cli.proxy_websockets);

        let cli = Cli::try_parse_from(["searchgate", "--proxy-websockets=false"]).unwrap();
        assert!(!cli.proxy_websockets);

        let cli = Cli::try_parse_from(["searchgate", "--proxy-websockets"]).unwrap();
        assert!(cli.proxy_websockets);
    }

    #[test]
    fn repeatable_flags_accumulate() {
        let cli = Cli::try_parse_from([
            "searchgate",
            "--upstream-ca",
            "/etc/ca/one.crt",
            "--upstream-ca",
            "/etc/ca/two.crt",
            "--auth-backend-role",
            r#"admin={"verb":"get","resource":"pods"}"#,
            "--auth-backend-role",
            r#"reader={"verb":"list","resource":"pods"}"#,
            "--auth-whitelisted-name",
            "system:serviceaccount:logging:kibana",
        ])
        .unwrap();
        assert_eq!(cli.upstream_ca.len(), 2);
        assert_eq!(cli.auth_backend_role.len(), 2);
        assert_eq!(cli.auth_whitelisted_name.len(), 1);
    }

    #[test]
    fn role_flags_are_optional_strings() {
        let cli = Cli::try_parse_from([
            "searchgate",
            "--auth-admin-role",
            "admin_reader",
            "--auth-default-role",
            "project_reader",
        ])
        .unwrap();
        assert_eq!(cli.auth_admin_role.as_deref(), Some("admin_reader"));
        assert_eq!(cli.auth_default_role.as_deref(), Some("project_reader"));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        assert!(Cli::try_parse_from(["searchgate", "--log-level", "banana"]).is_err());
    }

    #[test]
    fn log_format_text_accepted() {
        let cli = Cli::try_parse_from(["searchgate", "--log-format", "text"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn raw_options_carry_every_flag() {
        let cli = Cli::try_parse_from([
            "searchgate",
            "--listening-address",
            "0.0.0.0:8443",
            "--tls-cert",
            "/etc/proxy/tls.crt",
            "--tls-key",
            "/etc/proxy/tls.key",
            "--elasticsearch-url",
            "https://es.cluster.svc:9200",
            "--ssl-insecure-skip-verify",
            "--request-logging",
            "--http-max-conns-per-host",
            "25",
        ])
        .unwrap();
        let raw = cli.to_raw_options();
        assert_eq!(raw.listening_address, "0.0.0.0:8443");
        assert_eq!(raw.elasticsearch_url, "https://es.cluster.svc:9200");
        assert!(raw.ssl_insecure_skip_verify);
        assert!(raw.request_logging);
        assert_eq!(raw.http_max_conns_per_host, 25);
        assert_eq!(raw.tls_cert.as_deref(), Some(std::path::Path::new("/etc/proxy/tls.crt")));
    }
}
