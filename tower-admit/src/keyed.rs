use std::ops::ControlFlow;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use admit_limit::KeyedRegistry;
use admit_limit::Quota;
use admit_limit::Strategy;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::error::AdmitError;
use crate::future::ResponseFuture;
use crate::metrics::AdmissionMetrics;

/// Rate limits each client separately.
///
/// For every request, `key` derives the client identity (for example the
/// peer IP) and `quota` picks that client's rate and burst. The limiter is
/// resolved from the shared [`KeyedRegistry`], so clones of the layer and of
/// its services all see the same per-key state.
#[derive(Debug)]
pub struct KeyedRateLimitLayer<K, Q>
where
    K: ?Sized,
    Q: ?Sized,
{
    registry: Arc<KeyedRegistry>,
    key: Arc<K>,
    quota: Arc<Q>,
}

impl<K, Q> Clone for KeyedRateLimitLayer<K, Q>
where
    K: ?Sized,
    Q: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            key: Arc::clone(&self.key),
            quota: Arc::clone(&self.quota),
        }
    }
}

impl<K, Q> KeyedRateLimitLayer<K, Q> {
    pub fn new(registry: Arc<KeyedRegistry>, key: K, quota: Q) -> Self {
        Self::from_shared(registry, Arc::new(key), Arc::new(quota))
    }
}

impl<K, Q> KeyedRateLimitLayer<K, Q>
where
    K: ?Sized,
    Q: ?Sized,
{
    /// Build from already shared extractors, e.g. `Arc<dyn Fn(&Req) -> String>`.
    pub fn from_shared(registry: Arc<KeyedRegistry>, key: Arc<K>, quota: Arc<Q>) -> Self {
        Self {
            registry,
            key,
            quota,
        }
    }
}

impl<S, K, Q> Layer<S> for KeyedRateLimitLayer<K, Q>
where
    K: ?Sized,
    Q: ?Sized,
{
    type Service = KeyedRateLimitService<S, K, Q>;

    fn layer(&self, inner: S) -> Self::Service {
        KeyedRateLimitService {
            inner,
            registry: Arc::clone(&self.registry),
            key: Arc::clone(&self.key),
            quota: Arc::clone(&self.quota),
            metrics: AdmissionMetrics::new("keyed"),
        }
    }
}

/// Service produced by [`KeyedRateLimitLayer`].
///
/// The decision needs the request, so it happens in `call`: a rejected
/// request resolves to [`AdmitError::RateLimited`] without reaching the
/// inner service.
#[derive(Debug)]
pub struct KeyedRateLimitService<S, K, Q>
where
    K: ?Sized,
    Q: ?Sized,
{
    inner: S,
    registry: Arc<KeyedRegistry>,
    key: Arc<K>,
    quota: Arc<Q>,
    metrics: AdmissionMetrics,
}

impl<S, K, Q> Clone for KeyedRateLimitService<S, K, Q>
where
    S: Clone,
    K: ?Sized,
    Q: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            registry: Arc::clone(&self.registry),
            key: Arc::clone(&self.key),
            quota: Arc::clone(&self.quota),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S, K, Q, Req> Service<Req> for KeyedRateLimitService<S, K, Q>
where
    S: Service<Req, Error = BoxError>,
    K: Fn(&Req) -> String + ?Sized,
    Q: Fn(&Req) -> Quota + ?Sized,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key)(&req);
        let limiter = self.registry.resolve(&key, || (self.quota)(&req));

        match limiter.process() {
            ControlFlow::Continue(()) => ResponseFuture::admitted(self.inner.call(req)),
            ControlFlow::Break(reason) => {
                self.metrics.rejected();
                ResponseFuture::rejected(AdmitError::from(reason))
            }
        }
    }
}
