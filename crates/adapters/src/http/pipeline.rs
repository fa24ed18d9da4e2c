use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;

use domain::error::ProxyError;

/// One stage of the request pipeline.
///
/// A handler inspects or rewrites the request before it is dispatched
/// upstream. Handlers run on many requests concurrently and must not rely
/// on external serialization.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Name shown in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Process the request, returning the (possibly modified) request or an
    /// error that aborts the pipeline.
    async fn process(&self, req: Request<Body>) -> Result<Request<Body>, ProxyError>;
}

/// Error from a pipeline run, carrying which stage failed.
#[derive(Debug)]
pub struct PipelineFailure {
    pub handler: &'static str,
    pub error: ProxyError,
}

/// Ordered chain of request handlers.
///
/// Handlers run sequentially, threading the request through; the first
/// error aborts the chain and the upstream dispatch is skipped.
pub struct HandlerChain {
    handlers: Vec<Box<dyn RequestHandler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Box<dyn RequestHandler>>) -> Self {
        Self { handlers }
    }

    pub async fn run(&self, mut req: Request<Body>) -> Result<Request<Body>, PipelineFailure> {
        for handler in &self.handlers {
            tracing::trace!(handler = handler.name(), "running request handler");
            req = handler
                .process(req)
                .await
                .map_err(|error| PipelineFailure {
                    handler: handler.name(),
                    error,
                })?;
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TagHandler {
        name: &'static str,
        header: &'static str,
    }

    #[async_trait]
    impl RequestHandler for TagHandler {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn process(&self, mut req: Request<Body>) -> Result<Request<Body>, ProxyError> {
            req.headers_mut()
                .insert(self.header, self.name.parse().unwrap());
            Ok(req)
        }
    }

    struct FailingHandler {
        invoked: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RequestHandler for FailingHandler {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn process(&self, req: Request<Body>) -> Result<Request<Body>, ProxyError> {
            self.invoked.fetch_add(1, Ordering::SeqCst);
            drop(req);
            Err(ProxyError::IdentityUnresolved)
        }
    }

    struct CountingHandler {
        invoked: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RequestHandler for CountingHandler {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn process(&self, req: Request<Body>) -> Result<Request<Body>, ProxyError> {
            self.invoked.fetch_add(1, Ordering::SeqCst);
            Ok(req)
        }
    }

    fn request() -> Request<Body> {
        Request::builder().uri("/x").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn handlers_run_in_order_and_thread_the_request() {
        let chain = HandlerChain::new(vec![
            Box::new(TagHandler {
                name: "first",
                header: "x-test-first",
            }),
            Box::new(TagHandler {
                name: "second",
                header: "x-test-second",
            }),
        ]);

        let out = chain.run(request()).await.unwrap();
        assert_eq!(out.headers()["x-test-first"], "first");
        assert_eq!(out.headers()["x-test-second"], "second");
    }

    #[tokio::test]
    async fn first_error_short_circuits() {
        let failing_calls = Arc::new(AtomicUsize::new(0));
        let later_calls = Arc::new(AtomicUsize::new(0));
        let chain = HandlerChain::new(vec![
            Box::new(FailingHandler {
                invoked: Arc::clone(&failing_calls),
            }),
            Box::new(CountingHandler {
                invoked: Arc::clone(&later_calls),
            }),
        ]);

        let failure = chain.run(request()).await.unwrap_err();
        assert_eq!(failure.handler, "failing");
        assert!(matches!(failure.error, ProxyError::IdentityUnresolved));
        assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_chain_passes_the_request_through() {
        let chain = HandlerChain::new(vec![]);
        let out = chain.run(request()).await.unwrap();
        assert_eq!(out.uri().path(), "/x");
    }
}
