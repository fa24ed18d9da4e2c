use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use domain::error::ProxyError;
use domain::identity::entity::ResolvedIdentity;
use ports::secondary::metrics_port::IdentityCacheMetrics;

use crate::identity_resolver::IdentityResolver;

/// Bounded token → identity cache with absolute TTL and single-flight
/// loading.
///
/// Entries are evicted by capacity (LRU-class policy) or TTL from insertion
/// and never mutated in place. Concurrent `get` calls for the same cold
/// token share one resolver invocation; failed resolutions propagate to
/// every waiter and are not stored, so the next request retries.
///
/// Keys are opaque bearer tokens and are never logged.
pub struct IdentityCache {
    entries: Cache<String, Arc<ResolvedIdentity>>,
    resolver: IdentityResolver,
    metrics: Arc<dyn IdentityCacheMetrics>,
}

impl IdentityCache {
    pub fn new(
        resolver: IdentityResolver,
        capacity: u64,
        expiry: Duration,
        metrics: Arc<dyn IdentityCacheMetrics>,
    ) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(expiry)
            .build();
        Self {
            entries,
            resolver,
            metrics,
        }
    }

    /// Return the resolved identity for `token`, resolving it on first
    /// sight.
    pub async fn get(&self, token: &str) -> Result<Arc<ResolvedIdentity>, ProxyError> {
        let mut loaded = false;
        let result = self
            .entries
            .try_get_with(token.to_string(), async {
                loaded = true;
                self.metrics.record_cache_miss();
                debug!("identity cache miss, resolving");
                match self.resolver.resolve(token).await {
                    Ok(identity) => {
                        self.metrics.record_identity_load("ok");
                        Ok(Arc::new(identity))
                    }
                    Err(err) => {
                        let outcome = match &err {
                            ProxyError::Unauthenticated { .. } => "unauthenticated",
                            _ => "error",
                        };
                        self.metrics.record_identity_load(outcome);
                        Err(err)
                    }
                }
            })
            .await;

        match result {
            Ok(identity) => {
                if !loaded {
                    self.metrics.record_cache_hit();
                }
                Ok(identity)
            }
            Err(shared) => Err((*shared).clone()),
        }
    }

    /// Number of live entries; eviction runs lazily, so this is approximate.
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::identity::entity::{Project, TokenReviewOutcome};
    use ports::test_utils::{NoopMetrics, StubControlPlane};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    fn cache_over(stub: Arc<StubControlPlane>, expiry: Duration) -> IdentityCache {
        let resolver = IdentityResolver::new(stub, BTreeMap::new());
        IdentityCache::new(resolver, 1000, expiry, Arc::new(NoopMetrics))
    }

    fn authenticated_stub() -> Arc<StubControlPlane> {
        Arc::new(
            StubControlPlane::new()
                .with_review(TokenReviewOutcome::authenticated("jdoe", vec![]))
                .with_projects(vec![Project::new("p1", "u1")]),
        )
    }

    #[tokio::test]
    async fn second_get_within_ttl_is_a_hit() {
        let stub = authenticated_stub();
        let cache = cache_over(stub.clone(), Duration::from_secs(300));

        let first = cache.get("T1").await.unwrap();
        let second = cache.get("T1").await.unwrap();
        assert_eq!(first.review.username, second.review.username);
        assert_eq!(stub.token_reviews.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_tokens_load_separately() {
        let stub = authenticated_stub();
        let cache = cache_over(stub.clone(), Duration::from_secs(300));

        cache.get("T1").await.unwrap();
        cache.get("T2").await.unwrap();
        assert_eq!(stub.token_reviews.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entry_triggers_fresh_review() {
        let stub = authenticated_stub();
        let cache = cache_over(stub.clone(), Duration::from_millis(50));

        cache.get("T1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        cache.get("T1").await.unwrap();
        assert_eq!(stub.token_reviews.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let stub = Arc::new(StubControlPlane::new().with_review_error("connection refused"));
        let cache = Arc::new(cache_over(stub.clone(), Duration::from_secs(300)));

        assert!(cache.get("T1").await.is_err());
        assert!(cache.get("T1").await.is_err());
        // Both attempts hit the control plane: the failure was not stored.
        assert_eq!(stub.token_reviews.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unauthenticated_loads_are_not_cached() {
        let stub = Arc::new(
            StubControlPlane::new().with_review(TokenReviewOutcome::rejected("token expired")),
        );
        let cache = cache_over(stub.clone(), Duration::from_secs(300));

        let err = cache.get("T1").await.unwrap_err();
        assert!(matches!(err, ProxyError::Unauthenticated { .. }));
        cache.get("T1").await.unwrap_err();
        assert_eq!(stub.token_reviews.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_cold_gets_share_one_load() {
        let stub = authenticated_stub();
        let cache = Arc::new(cache_over(stub.clone(), Duration::from_secs(300)));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move { cache.get("T1").await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(stub.token_reviews.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_propagates_to_all_single_flight_waiters() {
        let stub = Arc::new(StubControlPlane::new().with_review_error("boom"));
        let cache = Arc::new(cache_over(stub, Duration::from_secs(300)));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move { cache.get("T1").await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }
    }
}
