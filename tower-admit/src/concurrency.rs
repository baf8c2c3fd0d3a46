use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use admit_limit::ConcurrencyLimiter;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::error::AdmitError;
use crate::metrics::AdmissionMetrics;

/// Caps the number of requests running the inner service at once.
///
/// Excess requests queue for a slot rather than being rejected. The slot is
/// held by the response future and released when it completes, fails,
/// panics, or is dropped.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimitLayer {
    limiter: Arc<ConcurrencyLimiter>,
}

impl ConcurrencyLimitLayer {
    pub fn new(limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for ConcurrencyLimitLayer {
    type Service = ConcurrencyLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConcurrencyLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            metrics: AdmissionMetrics::new("concurrency"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyLimitService<S> {
    inner: S,
    limiter: Arc<ConcurrencyLimiter>,
    metrics: AdmissionMetrics,
}

impl<S, Req> Service<Req> for ConcurrencyLimitService<S>
where
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Keep the instance that was driven to readiness for this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);
        let metrics = self.metrics.clone();

        Box::pin(async move {
            let Ok(_permit) = limiter.enter_owned().await else {
                metrics.rejected();
                return Err(Box::new(AdmitError::Overloaded) as BoxError);
            };
            inner.call(req).await
        })
    }
}
