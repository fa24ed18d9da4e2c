pub mod access_log;
pub mod authorization;
pub mod dispatch;
pub mod error;
pub mod metrics_server;
pub mod pipeline;
pub mod server;
pub mod state;
pub mod timeout;
pub mod tls;

pub use server::run_proxy_server;
pub use state::ProxyState;
