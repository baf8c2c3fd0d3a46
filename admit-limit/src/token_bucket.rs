use std::num::NonZeroUsize;
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

/// A token bucket refilled with one token per `interval`, up to `capacity`.
///
/// The whole bucket is one atomic word: the (shifted) instant at which the
/// bucket was last empty. The token count at `now` is
/// `min(capacity, (now - empty_at) / interval)`, so refill, the capacity cap
/// and the take happen in a single CAS. Taking `n` tokens advances `empty_at`
/// by exactly `n` intervals, which carries any partial interval forward.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: usize,
    interval: u64,
    /// `capacity * interval`; the clock is shifted by this so a full bucket
    /// starts at `empty_at == 0`.
    span: u64,
    empty_at: AtomicU64,
    clock: Clock,
    anchor: Instant,
}

impl Strategy for TokenBucket {
    #[inline]
    fn process(&self) -> ControlFlow<Reason> {
        self.try_take(1)
    }
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The maximum number of tokens held at once.
    /// * `interval` - The time it takes to mint a single token.
    pub fn new(capacity: NonZeroUsize, interval: Duration) -> Result<Self, ConfigError> {
        Self::with_clock(capacity, interval, Clock::new())
    }

    pub fn with_clock(
        capacity: NonZeroUsize,
        interval: Duration,
        clock: Clock,
    ) -> Result<Self, ConfigError> {
        let overflow = ConfigError::Overflow {
            capacity: capacity.get() as u64,
            interval,
        };
        let interval_ns = u64::try_from(interval.as_nanos()).map_err(|_| overflow.clone())?;
        if interval_ns == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        let span = (capacity.get() as u64)
            .checked_mul(interval_ns)
            .filter(|span| *span <= MAX_HORIZON_NS)
            .ok_or(overflow)?;
        let anchor = clock.now();

        Ok(Self {
            capacity: capacity.get(),
            interval: interval_ns,
            span,
            empty_at: AtomicU64::new(0),
            clock,
            anchor,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval)
    }

    /// Tokens that could be taken right now.
    pub fn available(&self) -> usize {
        let now = self.now();
        let base = self.empty_at.load(Ordering::Acquire).max(now - self.span);
        (now.saturating_sub(base) / self.interval) as usize
    }

    /// Attempts to withdraw `n` tokens at once.
    ///
    /// Either all `n` tokens are taken or none are.
    pub fn try_take(&self, n: usize) -> ControlFlow<Reason> {
        if n == 0 {
            return ControlFlow::Continue(());
        }
        if n > self.capacity {
            return ControlFlow::Break(Reason::Exceeded {
                requested: n,
                capacity: self.capacity,
            });
        }

        let now = self.now();
        let cost = n as u64 * self.interval;

        loop {
            let empty_at = self.empty_at.load(Ordering::Acquire);
            // Credit older than one full bucket is discarded.
            let base = empty_at.max(now - self.span);

            // A concurrent caller may have read a slightly later clock.
            if now.saturating_sub(base) < cost {
                let ready_at = base.saturating_add(cost);
                return ControlFlow::Break(Reason::Overloaded {
                    retry_after: Duration::from_nanos(ready_at.saturating_sub(now)),
                });
            }

            if self
                .empty_at
                .compare_exchange_weak(empty_at, base + cost, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return ControlFlow::Continue(());
            }
        }
    }

    /// Shifted clock reading, always `>= span`.
    #[inline]
    fn now(&self) -> u64 {
        elapsed_nanos(&self.clock, self.anchor).saturating_add(self.span)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use more_asserts::assert_le;

    use super::*;

    fn bucket(capacity: usize, interval: Duration) -> (TokenBucket, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let rl = TokenBucket::with_clock(NonZeroUsize::new(capacity).unwrap(), interval, clock)
            .unwrap();
        (rl, mock)
    }

    #[test]
    fn it_enforces_limits_starting_full() {
        let (rl, mock) = bucket(2, Duration::from_millis(100));

        // 1. Should be able to burst up to capacity immediately
        assert_eq!(rl.process(), ControlFlow::Continue(()));
        assert_eq!(rl.process(), ControlFlow::Continue(()));

        // 2. Third request should fail (exhausted)
        assert_eq!(
            rl.process(),
            ControlFlow::Break(Reason::Overloaded {
                retry_after: Duration::from_millis(100)
            })
        );

        // 3. One refill interval later there is exactly one new token
        mock.increment(Duration::from_millis(100));
        assert_eq!(rl.process(), ControlFlow::Continue(()));
        assert!(rl.process().is_break());
    }

    #[test]
    fn burst_of_ten_then_refill_after_one_interval() {
        let (rl, mock) = bucket(10, Duration::from_millis(100));

        for _ in 0..10 {
            assert!(rl.allow());
        }
        assert!(!rl.allow(), "11th request at t=0 must be rejected");

        mock.increment(Duration::from_millis(100));
        assert!(rl.allow(), "11th request at t=100ms must be admitted");
    }

    #[test]
    fn fractional_credit_is_carried_between_calls() {
        let (rl, mock) = bucket(10, Duration::from_millis(100));
        assert!(rl.try_take(10).is_continue());

        // Frequent calls must not throw away partial intervals.
        for _ in 0..3 {
            mock.increment(Duration::from_millis(30));
            assert!(rl.process().is_break());
        }

        mock.increment(Duration::from_millis(10));
        assert_eq!(
            rl.process(),
            ControlFlow::Continue(()),
            "Token should have accumulated at 100ms"
        );
    }

    #[test]
    fn idle_time_never_exceeds_capacity() {
        let (rl, mock) = bucket(3, Duration::from_millis(10));
        assert!(rl.try_take(3).is_continue());

        mock.increment(Duration::from_secs(60));
        assert_eq!(rl.available(), 3);
        assert!(rl.try_take(3).is_continue());
        assert!(rl.process().is_break());
    }

    #[test]
    fn rejected_take_does_not_consume() {
        let (rl, _mock) = bucket(5, Duration::from_millis(10));
        assert!(rl.try_take(3).is_continue());

        assert_eq!(
            rl.try_take(3),
            ControlFlow::Break(Reason::Overloaded {
                retry_after: Duration::from_millis(10)
            })
        );
        assert_eq!(rl.available(), 2);
        assert!(rl.try_take(2).is_continue());
    }

    #[test]
    fn oversized_and_empty_takes() {
        let (rl, _mock) = bucket(4, Duration::from_millis(10));

        assert_eq!(
            rl.try_take(5),
            ControlFlow::Break(Reason::Exceeded {
                requested: 5,
                capacity: 4
            })
        );
        assert!(rl.try_take(0).is_continue());
        assert_eq!(rl.available(), 4);
    }

    #[test]
    fn rejects_invalid_parameters() {
        let capacity = NonZeroUsize::new(1).unwrap();
        assert_eq!(
            TokenBucket::new(capacity, Duration::ZERO).unwrap_err(),
            ConfigError::ZeroInterval
        );

        let huge = NonZeroUsize::new(usize::MAX).unwrap();
        assert!(matches!(
            TokenBucket::new(huge, Duration::from_secs(1)),
            Err(ConfigError::Overflow { .. })
        ));
    }

    #[test]
    fn intervals_beyond_the_clock_horizon_are_rejected() {
        let one = NonZeroUsize::new(1).unwrap();
        assert!(matches!(
            TokenBucket::new(one, Duration::from_secs(u64::MAX)),
            Err(ConfigError::Overflow { .. })
        ));

        let century = Duration::from_secs(100 * 365 * 24 * 3600);
        assert!(matches!(
            TokenBucket::new(NonZeroUsize::new(2).unwrap(), century),
            Err(ConfigError::Overflow { .. })
        ));
    }

    #[test]
    fn very_slow_bucket_rejects_without_overflowing() {
        let century = Duration::from_secs(100 * 365 * 24 * 3600);
        let (rl, mock) = bucket(1, century);

        assert!(rl.allow());
        assert_eq!(
            rl.process(),
            ControlFlow::Break(Reason::Overloaded {
                retry_after: century
            })
        );

        mock.increment(Duration::from_secs(3600));
        assert!(rl.process().is_break());
        assert_eq!(rl.available(), 0);
    }

    #[test]
    fn token_count_stays_in_bounds_under_contention() {
        let capacity = 64;
        let (rl, _mock) = bucket(capacity, Duration::from_secs(1));
        let rl = Arc::new(rl);
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if rl.allow() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                        assert_le!(rl.available(), capacity);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Time is frozen, so exactly one bucket's worth is handed out.
        assert_eq!(admitted.load(Ordering::SeqCst), capacity);
        assert_eq!(rl.available(), 0);
    }
}
