use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

use crate::ConfigError;
use crate::MAX_HORIZON_NS;
use crate::Reason;
use crate::Strategy;
use crate::elapsed_nanos;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Validated rate + burst parameters for a [`FixedRate`].
///
/// A quota is cheap to copy, so a factory can hand a fresh one to every
/// limiter it builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Nanoseconds of credit per permit.
    emission_ns: u64,
    burst: u32,
}

impl Quota {
    /// `rate` permits per second with at most `burst` saved up.
    ///
    /// The per-permit interval is rounded up to a whole nanosecond, so the
    /// effective rate never exceeds `rate`. Rates so slow that a full burst
    /// would reach past the limiter's clock horizon fail with
    /// [`ConfigError::Overflow`].
    pub fn new(rate: f64, burst: NonZeroU32) -> Result<Self, ConfigError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidRate(rate));
        }
        let emission = (NANOS_PER_SEC / rate).ceil();
        if emission >= u64::MAX as f64 {
            return Err(ConfigError::InvalidRate(rate));
        }
        Self::from_emission(emission as u64, burst)
    }

    /// One permit every `interval` with at most `burst` saved up.
    pub fn per_interval(interval: Duration, burst: NonZeroU32) -> Result<Self, ConfigError> {
        let emission_ns = u64::try_from(interval.as_nanos()).map_err(|_| ConfigError::Overflow {
            capacity: burst.get() as u64,
            interval,
        })?;
        if emission_ns == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Self::from_emission(emission_ns, burst)
    }

    fn from_emission(emission_ns: u64, burst: NonZeroU32) -> Result<Self, ConfigError> {
        let emission_ns = emission_ns.max(1);
        // The TAT runs at most one emission past the burst tolerance.
        emission_ns
            .checked_mul(burst.get() as u64 + 1)
            .filter(|ahead| *ahead <= MAX_HORIZON_NS)
            .ok_or(ConfigError::Overflow {
                capacity: burst.get() as u64,
                interval: Duration::from_nanos(emission_ns),
            })?;
        Ok(Self {
            emission_ns,
            burst: burst.get(),
        })
    }

    /// Permits per second actually enforced.
    pub fn rate(&self) -> f64 {
        NANOS_PER_SEC / self.emission_ns as f64
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.emission_ns)
    }

    fn tolerance_ns(&self) -> u64 {
        // Checked in `from_emission`.
        self.emission_ns * self.burst as u64
    }
}

/// A continuously refilling limiter: `rate` permits per second, up to `burst`
/// at once.
///
/// Implemented as the Generic Cell Rate Algorithm. The single piece of state
/// is the Theoretical Arrival Time (TAT): the instant at which the limiter
/// would be full again. Credit at `now` is `(now + burst * T - tat) / T` for an
/// emission interval `T`, which is exactly a token bucket refilled
/// continuously and clamped at `burst`.
#[derive(Debug)]
pub struct FixedRate {
    quota: Quota,
    /// Theoretical Arrival Time in nanoseconds since `anchor`.
    tat: AtomicU64,
    tolerance_ns: u64,
    clock: Clock,
    anchor: Instant,
}

impl FixedRate {
    pub fn new(quota: Quota) -> Self {
        Self::with_clock(quota, Clock::new())
    }

    pub fn with_clock(quota: Quota, clock: Clock) -> Self {
        let anchor = clock.now();
        Self {
            quota,
            tat: AtomicU64::new(0),
            tolerance_ns: quota.tolerance_ns(),
            clock,
            anchor,
        }
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Whole permits available right now.
    pub fn remaining(&self) -> u32 {
        let now = elapsed_nanos(&self.clock, self.anchor);
        let tat = self.tat.load(Ordering::Acquire);
        if tat <= now {
            return self.quota.burst;
        }
        // A partially refilled permit counts as used.
        let used = (tat - now).div_ceil(self.quota.emission_ns);
        self.quota.burst.saturating_sub(used as u32)
    }
}

impl Strategy for FixedRate {
    #[inline]
    fn process(&self) -> ControlFlow<Reason> {
        let now = elapsed_nanos(&self.clock, self.anchor);

        loop {
            let tat = self.tat.load(Ordering::Acquire);

            let arrival = tat.max(now);
            let next_tat = arrival.saturating_add(self.quota.emission_ns);
            let allowed_until = now.saturating_add(self.tolerance_ns);

            if next_tat > allowed_until {
                return ControlFlow::Break(Reason::Overloaded {
                    retry_after: Duration::from_nanos(next_tat - allowed_until),
                });
            }

            if self
                .tat
                .compare_exchange_weak(tat, next_tat, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return ControlFlow::Continue(());
            }
        }
    }
}
