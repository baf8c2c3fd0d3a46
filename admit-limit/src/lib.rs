//! # admit-limit
//!
//! `admit-limit` provides the decision half of request admission control: a set of
//! in-memory limiters that answer "may this request proceed?" without doing any I/O.
//!
//! ## Limiters
//!
//! * [`TokenBucket`]: a bucket of `capacity` tokens refilled one token per interval.
//! * [`FixedRate`]: a continuous rate (permits per second) with a burst allowance.
//! * [`KeyedRegistry`]: one [`FixedRate`] per key, created on first use and evicted
//!   once idle for longer than its TTL.
//! * [`ConcurrencyLimiter`]: bounds the number of requests in flight. Unlike the
//!   others it never rejects; callers wait for a slot.
//!
//! ## Key Concepts
//!
//! * **Lock-Free**: bucket and rate state live in a single atomic word updated with
//!   Compare-And-Swap loops, so refill and take are one linearizable step.
//! * **Lazy Evaluation**: tokens are recalculated at the moment of the request,
//!   eliminating the need for background refill timers.
//! * **Strategy Trait**: a unified non-blocking interface for the rate strategies.
//!
//! ## Example
//!
//! ```rust
//! use admit_limit::Strategy;
//! use admit_limit::TokenBucket;
//! use std::num::NonZeroUsize;
//! use std::time::Duration;
//!
//! let capacity = NonZeroUsize::new(10).unwrap();
//! let bucket = TokenBucket::new(capacity, Duration::from_millis(100)).unwrap();
//!
//! if bucket.process().is_continue() {
//!     // Request allowed
//! }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

mod concurrency;
mod error;
mod fixed_rate;
mod keyed;
mod token_bucket;

pub use concurrency::Closed;
pub use concurrency::ConcurrencyLimiter;
pub use concurrency::OwnedPermit;
pub use concurrency::Permit;
pub use error::ConfigError;
pub use fixed_rate::FixedRate;
pub use fixed_rate::Quota;
pub use keyed::KeyedRegistry;
pub use token_bucket::TokenBucket;

/// Reasons why a request might be rejected by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// Not enough credit right now; enough will have accrued after `retry_after`.
    Overloaded { retry_after: Duration },
    /// The request asks for more than the limiter can ever hold.
    Exceeded { requested: usize, capacity: usize },
}

/// The core trait for the rate-limiting algorithms.
///
/// Strategies are shared across tasks via `Arc`, so implementations keep their
/// state behind atomics.
pub trait Strategy: Debug {
    /// Attempts to admit a single request.
    ///
    /// This method never blocks. A `Break` is final for this call; the
    /// limiter's state is left untouched.
    fn process(&self) -> ControlFlow<Reason>;

    /// `true` when [`Strategy::process`] admits.
    fn allow(&self) -> bool {
        self.process().is_continue()
    }
}

/// Longest span, in nanoseconds, a limiter may keep ahead of its clock.
///
/// About 146 years. Keeping state within this horizon leaves the hot-path
/// sums `now + span + interval` well inside `u64`.
pub(crate) const MAX_HORIZON_NS: u64 = u64::MAX / 4;

/// Nanoseconds elapsed on `clock` since `anchor`.
#[inline]
pub(crate) fn elapsed_nanos(clock: &quanta::Clock, anchor: quanta::Instant) -> u64 {
    clock.now().duration_since(anchor).as_nanos() as u64
}
