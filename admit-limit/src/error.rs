use std::time::Duration;

/// Invalid limiter parameters, reported when a limiter is built.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A refill or emission interval of zero would mint unlimited tokens.
    #[error("refill interval must be greater than zero")]
    ZeroInterval,

    /// Rates must be finite and strictly positive.
    #[error("rate must be a finite number greater than zero, got {0}")]
    InvalidRate(f64),

    /// Keyed entries need a lifetime to be evictable.
    #[error("entry ttl must be greater than zero")]
    ZeroTtl,

    /// `capacity * interval` does not fit in the nanosecond clock.
    #[error("capacity of {capacity} over {interval:?} overflows the limiter clock")]
    Overflow { capacity: u64, interval: Duration },
}
