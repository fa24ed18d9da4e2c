use std::time::Duration;

/// Default bind address of the main HTTPS listener.
pub const DEFAULT_LISTENING_ADDRESS: &str = "0.0.0.0:8443";

/// Default upstream cluster URL.
pub const DEFAULT_UPSTREAM_URL: &str = "https://127.0.0.1:9200";

/// Default forced-flush interval for streamed upstream responses.
pub const DEFAULT_UPSTREAM_FLUSH: Duration = Duration::from_millis(5);

/// Default identity cache TTL.
pub const DEFAULT_CACHE_EXPIRY: Duration = Duration::from_secs(300);

/// Default identity cache capacity (tokens).
pub const DEFAULT_CACHE_SIZE: u64 = 1000;

/// Default idle upstream connections kept per host.
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 500;

/// Default idle upstream connection lifetime.
pub const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on upstream connect + TLS handshake.
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default Expect: 100-continue wait.
pub const DEFAULT_EXPECT_CONTINUE_TIMEOUT: Duration = Duration::from_secs(1);

/// TCP keep-alive period on accepted connections.
pub const TCP_KEEPALIVE_PERIOD: Duration = Duration::from_secs(180);

/// How long shutdown waits for listeners to drain.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
