use std::sync::Arc;
use std::time::Duration;

use admit_limit::ConcurrencyLimiter;
use admit_limit::FixedRate;
use admit_limit::KeyedRegistry;
use admit_limit::Quota;
use admit_limit::TokenBucket;
use tokio::task::JoinHandle;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::util::BoxCloneSyncService;

use crate::ConcurrencyLimitLayer;
use crate::KeyedRateLimitLayer;
use crate::RateLimitLayer;
use crate::sweeper::spawn_eviction;

/// A limiter built from configuration, ready to guard one route.
#[derive(Debug, Clone)]
pub enum Limiter {
    TokenBucket(Arc<TokenBucket>),
    Concurrency(Arc<ConcurrencyLimiter>),
    FixedRate(Arc<FixedRate>),
    Keyed {
        registry: Arc<KeyedRegistry>,
        quota: Quota,
        sweep_every: Duration,
    },
}

impl Limiter {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenBucket(_) => "token_bucket",
            Self::Concurrency(_) => "concurrency",
            Self::FixedRate(_) => "fixed_rate",
            Self::Keyed { .. } => "keyed",
        }
    }

    /// Starts the eviction task for keyed limiters. Must be called from
    /// within a tokio runtime.
    pub fn start_eviction(&self) -> Option<JoinHandle<()>> {
        match self {
            Self::Keyed {
                registry,
                sweep_every,
                ..
            } => Some(spawn_eviction(registry, *sweep_every)),
            _ => None,
        }
    }
}

type KeyFn<Req> = dyn Fn(&Req) -> String + Send + Sync;
type QuotaFn<Req> = dyn Fn(&Req) -> Quota + Send + Sync;

/// Guards a route with whichever [`Limiter`] it was configured with.
///
/// Rate limiters reject with [`crate::AdmitError::RateLimited`]; the
/// concurrency limiter queues. Keyed limiters use the key extractor set with
/// [`AdmissionLayer::with_key`]; without one every request shares a single
/// key.
pub struct AdmissionLayer<Req> {
    limiter: Limiter,
    key: Arc<KeyFn<Req>>,
}

impl<Req> Clone for AdmissionLayer<Req> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            key: Arc::clone(&self.key),
        }
    }
}

impl<Req: 'static> AdmissionLayer<Req> {
    pub fn new(limiter: Limiter) -> Self {
        Self {
            limiter,
            key: Arc::new(|_: &Req| String::new()),
        }
    }

    /// How keyed limiters derive a client identity from a request.
    pub fn with_key<K>(mut self, key: K) -> Self
    where
        K: Fn(&Req) -> String + Send + Sync + 'static,
    {
        self.key = Arc::new(key);
        self
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }
}

impl<S, Req> Layer<S> for AdmissionLayer<Req>
where
    S: Service<Req, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Send + 'static,
{
    type Service = BoxCloneSyncService<Req, S::Response, BoxError>;

    fn layer(&self, inner: S) -> Self::Service {
        match &self.limiter {
            Limiter::TokenBucket(bucket) => BoxCloneSyncService::new(
                RateLimitLayer::fail_fast(Arc::clone(bucket)).layer(inner),
            ),
            Limiter::FixedRate(fixed) => BoxCloneSyncService::new(
                RateLimitLayer::fail_fast(Arc::clone(fixed)).layer(inner),
            ),
            Limiter::Concurrency(limiter) => BoxCloneSyncService::new(
                ConcurrencyLimitLayer::new(Arc::clone(limiter)).layer(inner),
            ),
            Limiter::Keyed {
                registry, quota, ..
            } => {
                let quota = *quota;
                let quota: Arc<QuotaFn<Req>> = Arc::new(move |_: &Req| quota);
                BoxCloneSyncService::new(
                    KeyedRateLimitLayer::from_shared(
                        Arc::clone(registry),
                        Arc::clone(&self.key),
                        quota,
                    )
                    .layer(inner),
                )
            }
        }
    }
}
