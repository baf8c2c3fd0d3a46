use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::sync::SemaphorePermit;
use tokio::sync::TryAcquireError;

/// The limiter was closed while a caller was waiting for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("concurrency limiter is closed")]
pub struct Closed;

/// Bounds how many requests are in flight at once.
///
/// This is the one limiter that applies backpressure instead of rejecting:
/// [`ConcurrencyLimiter::enter`] waits until a slot frees up. The returned
/// permit gives the slot back when dropped, so release happens on every exit
/// path: normal return, error, panic unwind, or cancellation of the caller's
/// future. Waiting is cancel safe; a caller dropped while queued holds no slot.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// A held slot, borrowed from its limiter.
#[must_use = "the slot is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct Permit<'a> {
    _permit: SemaphorePermit<'a>,
}

/// A held slot that can move into a spawned future.
#[must_use = "the slot is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct OwnedPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.get())),
            limit: limit.get(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Waits for a free slot. Waiters are served in FIFO order.
    pub async fn enter(&self) -> Result<Permit<'_>, Closed> {
        let permit = self.semaphore.acquire().await.map_err(|_| Closed)?;
        Ok(Permit { _permit: permit })
    }

    /// Like [`ConcurrencyLimiter::enter`], but the permit owns a handle to the
    /// limiter and is `'static`.
    pub async fn enter_owned(&self) -> Result<OwnedPermit, Closed> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Closed)?;
        Ok(OwnedPermit { _permit: permit })
    }

    /// Takes a slot only if one is free right now.
    pub fn try_enter(&self) -> Option<Permit<'_>> {
        match self.semaphore.try_acquire() {
            Ok(permit) => Some(Permit { _permit: permit }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Fails all current and future waiters. Slots already held stay valid
    /// until their permits drop.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

impl Permit<'_> {
    /// Gives the slot back. Equivalent to dropping the permit.
    pub fn leave(self) {}
}

impl OwnedPermit {
    /// Gives the slot back. Equivalent to dropping the permit.
    pub fn leave(self) {}
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use more_asserts::assert_le;
    use tokio::sync::oneshot;

    use super::*;

    fn limiter(limit: usize) -> Arc<ConcurrencyLimiter> {
        Arc::new(ConcurrencyLimiter::new(NonZeroUsize::new(limit).unwrap()))
    }

    #[tokio::test]
    async fn two_proceed_and_third_waits_for_leave() {
        let rl = limiter(2);

        let first = rl.enter().await.unwrap();
        let _second = rl.enter().await.unwrap();
        assert_eq!(rl.in_flight(), 2);

        let waiter = tokio::spawn({
            let rl = Arc::clone(&rl);
            async move {
                let _permit = rl.enter_owned().await.unwrap();
            }
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished(), "third caller must wait");

        first.leave();
        waiter.await.unwrap();
        assert_eq!(rl.in_flight(), 1);
    }

    #[tokio::test]
    async fn try_enter_never_exceeds_limit() {
        let rl = limiter(3);
        let held: Vec<_> = (0..5).filter_map(|_| rl.try_enter()).collect();
        assert_eq!(held.len(), 3);
        assert!(rl.try_enter().is_none());

        drop(held);
        assert_eq!(rl.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn admits_exactly_n_of_n_plus_k() {
        let n = 4;
        let k = 6;
        let rl = limiter(n);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut handles = vec![];
        for _ in 0..n + k {
            let rl = Arc::clone(&rl);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let mut release_rx = release_rx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = rl.enter_owned().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let _ = release_rx.wait_for(|released| *released).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        // Give everyone a chance to queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(current.load(Ordering::SeqCst), n);
        assert_eq!(rl.in_flight(), n);

        release_tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
        assert_le!(peak.load(Ordering::SeqCst), n);
        assert_eq!(rl.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_reservation() {
        let rl = limiter(1);
        let held = rl.enter().await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(10), rl.enter()).await;
        assert!(timed_out.is_err());

        held.leave();
        assert_eq!(rl.in_flight(), 0);
        assert!(rl.try_enter().is_some());
    }

    #[tokio::test]
    async fn slot_is_released_when_the_holder_panics() {
        let rl = limiter(1);

        let task = tokio::spawn({
            let rl = Arc::clone(&rl);
            async move {
                let _permit = rl.enter_owned().await.unwrap();
                panic!("handler failed");
            }
        });
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(rl.in_flight(), 0);
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let rl = limiter(1);
        let _held = rl.enter().await.unwrap();
        let (tx, rx) = oneshot::channel();

        let waiter = tokio::spawn({
            let rl = Arc::clone(&rl);
            async move {
                let res = rl.enter_owned().await.map(|_| ());
                let _ = tx.send(());
                res
            }
        });

        tokio::task::yield_now().await;
        rl.close();
        rx.await.unwrap();
        assert_eq!(waiter.await.unwrap(), Err(Closed));
        assert!(rl.is_closed());
    }
}
