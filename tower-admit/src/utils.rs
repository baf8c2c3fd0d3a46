use std::sync::Arc;

use admit_limit::ConcurrencyLimiter;
use admit_limit::KeyedRegistry;
use admit_limit::Strategy;
use tower::ServiceBuilder;
use tower::layer::util::Stack;

use crate::ConcurrencyLimitLayer;
use crate::KeyedRateLimitLayer;
use crate::RateLimitLayer;

/// Service Builder Extension with the admission layers.
pub trait ServiceBuilderExt<L> {
    /// Reject requests once the shared strategy runs dry.
    fn admit_rate<S>(self, limiter: Arc<S>) -> ServiceBuilder<Stack<RateLimitLayer<S>, L>>
    where
        S: Strategy + ?Sized;

    /// Reject requests once the requesting client's own limiter runs dry.
    fn admit_keyed<K, Q>(
        self,
        registry: Arc<KeyedRegistry>,
        key: K,
        quota: Q,
    ) -> ServiceBuilder<Stack<KeyedRateLimitLayer<K, Q>, L>>;

    /// Queue requests beyond the limiter's in-flight bound.
    fn admit_concurrency(
        self,
        limiter: Arc<ConcurrencyLimiter>,
    ) -> ServiceBuilder<Stack<ConcurrencyLimitLayer, L>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn admit_rate<S>(self, limiter: Arc<S>) -> ServiceBuilder<Stack<RateLimitLayer<S>, L>>
    where
        S: Strategy + ?Sized,
    {
        self.layer(RateLimitLayer::fail_fast(limiter))
    }

    fn admit_keyed<K, Q>(
        self,
        registry: Arc<KeyedRegistry>,
        key: K,
        quota: Q,
    ) -> ServiceBuilder<Stack<KeyedRateLimitLayer<K, Q>, L>> {
        self.layer(KeyedRateLimitLayer::new(registry, key, quota))
    }

    fn admit_concurrency(
        self,
        limiter: Arc<ConcurrencyLimiter>,
    ) -> ServiceBuilder<Stack<ConcurrencyLimitLayer, L>> {
        self.layer(ConcurrencyLimitLayer::new(limiter))
    }
}
