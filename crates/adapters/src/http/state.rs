use std::sync::Arc;

use ports::secondary::metrics_port::MetricsPort;

use super::dispatch::UpstreamDispatcher;
use super::pipeline::HandlerChain;

/// Shared state behind the proxy router: the handler pipeline, the upstream
/// dispatcher, and the mount prefix requests must live under.
pub struct ProxyState {
    pub pipeline: HandlerChain,
    pub dispatcher: UpstreamDispatcher,
    pub mount_path: String,
    pub metrics: Arc<dyn MetricsPort>,
}

impl ProxyState {
    pub fn new(
        pipeline: HandlerChain,
        dispatcher: UpstreamDispatcher,
        mount_path: String,
        metrics: Arc<dyn MetricsPort>,
    ) -> Self {
        Self {
            pipeline,
            dispatcher,
            mount_path,
            metrics,
        }
    }
}
