use std::sync::Arc;
use std::time::Duration;

use admit_limit::KeyedRegistry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::trace;

/// Periodically evicts idle entries from `registry`.
///
/// The task holds only a weak reference and exits on the first tick after
/// the registry is dropped.
///
/// # Panics
///
/// Panics if `every` is zero.
pub fn spawn_eviction(registry: &Arc<KeyedRegistry>, every: Duration) -> JoinHandle<()> {
    let registry = Arc::downgrade(registry);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(registry) = registry.upgrade() else {
                debug!("keyed registry dropped, stopping eviction");
                return;
            };

            let evicted = registry.evict();
            if evicted > 0 {
                debug!(evicted, remaining = registry.len(), "evicted idle keyed limiters");
            } else {
                trace!(remaining = registry.len(), "eviction sweep found nothing idle");
            }
        }
    })
}
