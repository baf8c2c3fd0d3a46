use std::sync::Arc;
use std::time::Duration;

use admit_limit::Strategy;
use tower::Layer;

use crate::service::RateLimitService;

/// Puts one shared [`Strategy`] in front of every service it wraps.
///
/// All services built by a layer (and by its clones) draw permits from the
/// same limiter, so a route guarded by one layer has a single global rate.
///
/// Two admission modes:
///
/// * [`RateLimitLayer::fail_fast`]: a request the limiter refuses fails in
///   `poll_ready` with [`crate::AdmitError::RateLimited`]. This is what the
///   configured routes use.
/// * [`RateLimitLayer::waiting`]: the service stays `Pending` until the
///   limiter admits, optionally giving up after [`RateLimitLayer::with_max_wait`].
#[derive(Debug)]
pub struct RateLimitLayer<L>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    fail_fast: bool,
    max_wait: Option<Duration>,
}

impl<L> Clone for RateLimitLayer<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            fail_fast: self.fail_fast,
            max_wait: self.max_wait,
        }
    }
}

impl<L> RateLimitLayer<L>
where
    L: Strategy + ?Sized,
{
    /// Rejects as soon as the limiter has no permit.
    pub fn fail_fast(limiter: Arc<L>) -> Self {
        Self::waiting(limiter).with_fail_fast(true)
    }

    /// Holds requests in `poll_ready` until the limiter's `retry_after` hint
    /// has passed and a permit is granted. Waits are unbounded unless
    /// [`RateLimitLayer::with_max_wait`] is set.
    pub fn waiting(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            fail_fast: false,
            max_wait: None,
        }
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Caps the time a request spends queued for a permit; past it the
    /// request fails with [`crate::AdmitError::Timeout`].
    ///
    /// Only admission is bounded. Once admitted, the inner service runs for as
    /// long as it takes; wrap it in `tower::timeout` to bound that too. Has no
    /// effect in fail-fast mode, which never queues.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

impl<L, S> Layer<S> for RateLimitLayer<L>
where
    L: ?Sized,
{
    type Service = RateLimitService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        let svc =
            RateLimitService::new(service, Arc::clone(&self.limiter)).with_fail_fast(self.fail_fast);
        match self.max_wait {
            Some(max_wait) => svc.with_max_wait(max_wait),
            None => svc,
        }
    }
}
