use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use quanta::Clock;
use quanta::Instant;

use crate::ConfigError;
use crate::FixedRate;
use crate::Quota;
use crate::elapsed_nanos;

#[derive(Debug)]
struct Entry {
    limiter: Arc<FixedRate>,
    /// Nanoseconds since the registry anchor.
    expires_at: u64,
}

/// Per-key [`FixedRate`] limiters with a sliding TTL.
///
/// Each key gets its own limiter the first time it is resolved, so one noisy
/// client cannot drain another's budget. Every [`KeyedRegistry::resolve`]
/// pushes the entry's expiry `ttl` into the future; [`KeyedRegistry::evict`]
/// drops entries that were not resolved for a full `ttl`.
///
/// The map is sharded, so lookups for different keys rarely contend.
/// Get-or-create runs under the key's shard lock, so concurrent first lookups
/// for one key observe the same limiter.
#[derive(Debug)]
pub struct KeyedRegistry {
    entries: DashMap<String, Entry>,
    ttl: u64,
    clock: Clock,
    anchor: Instant,
}

impl KeyedRegistry {
    pub fn new(ttl: Duration) -> Result<Self, ConfigError> {
        Self::with_clock(ttl, Clock::new())
    }

    /// Limiters created by the registry share `clock`.
    pub fn with_clock(ttl: Duration, clock: Clock) -> Result<Self, ConfigError> {
        let ttl = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);
        if ttl == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        let anchor = clock.now();
        Ok(Self {
            entries: DashMap::new(),
            ttl,
            clock,
            anchor,
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_nanos(self.ttl)
    }

    /// Returns the limiter for `key`, creating it from `make_quota` when the
    /// key is unknown or its entry has expired.
    ///
    /// `make_quota` is only called on a miss. Any hit refreshes the entry's
    /// expiry, whether or not the caller's request is later admitted.
    pub fn resolve<F>(&self, key: &str, make_quota: F) -> Arc<FixedRate>
    where
        F: FnOnce() -> Quota,
    {
        let now = self.now();
        let expires_at = now.saturating_add(self.ttl);

        // Fast path without allocating an owned key.
        if let Some(mut entry) = self.entries.get_mut(key)
            && entry.expires_at > now
        {
            entry.expires_at = expires_at;
            return Arc::clone(&entry.limiter);
        }

        match self.entries.entry(key.to_owned()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.expires_at <= now {
                    entry.limiter = Arc::new(self.build(make_quota()));
                }
                entry.expires_at = expires_at;
                Arc::clone(&entry.limiter)
            }
            MapEntry::Vacant(vacant) => {
                let limiter = Arc::new(self.build(make_quota()));
                vacant.insert(Entry {
                    limiter: Arc::clone(&limiter),
                    expires_at,
                });
                limiter
            }
        }
    }

    /// Removes every entry whose expiry has passed. Returns how many were
    /// removed.
    pub fn evict(&self) -> usize {
        let now = self.now();
        let mut evicted = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn build(&self, quota: Quota) -> FixedRate {
        FixedRate::with_clock(quota, self.clock.clone())
    }

    #[inline]
    fn now(&self) -> u64 {
        elapsed_nanos(&self.clock, self.anchor)
    }
}
