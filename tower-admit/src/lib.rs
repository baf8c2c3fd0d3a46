//! # Tower Admit
//!
//! `tower-admit` puts the limiters from [`admit_limit`] in front of
//! [Tower](https://github.com/tower-rs/tower) services. Each protected route gets
//! exactly one limiter, consulted before the handler runs:
//!
//! 1. **Global rate** ([`RateLimitLayer`]): a shared [`admit_limit::TokenBucket`] or
//!    [`admit_limit::FixedRate`]. In fail-fast mode a rejection short-circuits with
//!    [`AdmitError::RateLimited`]; otherwise the request waits in `poll_ready`.
//! 2. **Per client** ([`KeyedRateLimitLayer`]): one limiter per key derived from the
//!    request, held in a [`admit_limit::KeyedRegistry`] and swept by
//!    [`spawn_eviction`].
//! 3. **Concurrency** ([`ConcurrencyLimitLayer`]): requests beyond the in-flight bound
//!    queue for a slot; the slot is released however the handler exits.
//!
//! [`AdmissionConfig`] describes all of these per route and [`AdmissionLayer`] wires
//! whichever one a route was configured with.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`AdmitError`] (429 with `Retry-After` for
//!   rejections), `handle_admit_error` for `HandleErrorLayer`, and `client_ip` for
//!   keying by client address.

mod admission;
mod concurrency;
mod config;
mod error;
#[cfg(feature = "axum")]
mod extract;
mod future;
mod keyed;
mod layer;
mod metrics;
mod service;
mod sweeper;
mod utils;


pub use admission::AdmissionLayer;
pub use admission::Limiter;
pub use concurrency::ConcurrencyLimitLayer;
pub use concurrency::ConcurrencyLimitService;
pub use config::AdmissionConfig;
pub use config::LimiterConfig;
pub use config::LoadError;
pub use error::AdmitError;
#[cfg(feature = "axum")]
pub use error::handle_admit_error;
#[cfg(feature = "axum")]
pub use extract::client_ip;
pub use future::ResponseFuture;
pub use keyed::KeyedRateLimitLayer;
pub use keyed::KeyedRateLimitService;
pub use layer::RateLimitLayer;
pub use service::RateLimitService;
pub use sweeper::spawn_eviction;
pub use utils::ServiceBuilderExt;
