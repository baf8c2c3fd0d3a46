use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use tokio::time::Instant;
use tokio::time::Sleep;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;

use admit_limit::Reason;
use admit_limit::Strategy;

use crate::error::AdmitError;
use crate::metrics::AdmissionMetrics;

/// Consults a shared [`Strategy`] in `poll_ready`.
///
/// In fail-fast mode a rejection is returned immediately as
/// [`AdmitError::RateLimited`]. Otherwise the service stays `Pending` and
/// sleeps for the strategy's `retry_after` hint until a permit is granted, or
/// until the optional wait budget runs out ([`AdmitError::Timeout`]).
#[derive(Debug)]
pub struct RateLimitService<L, S>
where
    L: ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    sleep: Option<Pin<Box<Sleep>>>,
    permit_acquired: bool,
    fail_fast: bool,
    max_wait: Option<Duration>,
    wait_start: Option<Instant>,
    metrics: AdmissionMetrics,
}

// Manually implement Clone because Pin<Box<Sleep>> cannot be cloned
impl<L, S> Clone for RateLimitService<L, S>
where
    L: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            // A clone has not been granted anything yet
            sleep: None,
            permit_acquired: false,
            fail_fast: self.fail_fast,
            max_wait: self.max_wait,
            wait_start: None,
            metrics: self.metrics.clone(),
        }
    }
}

impl<L, S, Req> Service<Req> for RateLimitService<L, S>
where
    L: Strategy + ?Sized,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 1. If we are sleeping on a retry hint, finish that first
        if let Some(fut) = self.sleep.as_mut() {
            if fut.as_mut().poll(cx).is_pending() {
                self.metrics.early_wake();
                return Poll::Pending;
            }
            self.sleep = None;
        }

        // 2. Check inner readiness FIRST to avoid consuming permits we cannot use
        ready!(self.inner.poll_ready(cx))?;

        if self.permit_acquired {
            return Poll::Ready(Ok(()));
        }

        let retry_after = match self.limiter.process() {
            ControlFlow::Continue(()) => {
                self.permit_acquired = true;
                self.wait_start = None;
                return Poll::Ready(Ok(()));
            }
            ControlFlow::Break(Reason::Overloaded { retry_after }) if !self.fail_fast => {
                retry_after
            }
            ControlFlow::Break(reason) => return Poll::Ready(Err(self.reject(reason.into()))),
        };

        // 3. Wait for the hint, bounded by whatever is left of the wait budget
        let start = *self.wait_start.get_or_insert_with(Instant::now);
        let nap = match self.max_wait {
            Some(max_wait) => {
                let remaining = max_wait.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    return Poll::Ready(Err(self.reject(AdmitError::Timeout)));
                }
                retry_after.min(remaining)
            }
            None => retry_after,
        };

        let mut fut = Box::pin(sleep(nap));
        if fut.as_mut().poll(cx).is_pending() {
            self.sleep = Some(fut);
        } else {
            // Zero-length hint: try again on the next poll
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.permit_acquired = false;
        self.inner.call(req)
    }
}

impl<L, S> RateLimitService<L, S>
where
    L: ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        Self {
            inner,
            limiter,
            sleep: None,
            permit_acquired: false,
            fail_fast: false,
            max_wait: None,
            wait_start: None,
            metrics: AdmissionMetrics::new(std::any::type_name::<L>()),
        }
    }

    /// Reject immediately instead of waiting for the strategy to recover.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Give up with [`AdmitError::Timeout`] after waiting this long for a permit.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    fn reject(&mut self, err: AdmitError) -> BoxError {
        self.wait_start = None;
        self.metrics.rejected();
        Box::new(err)
    }
}
