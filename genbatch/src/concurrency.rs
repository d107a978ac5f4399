//! A counting semaphore bounding the number of batches in flight.
//!
//! Unlike [`tokio::sync::Semaphore`] the limiter hands out no permits: callers check
//! [`ConcurrencyLimiter::can_start`], call [`ConcurrencyLimiter::acquire`], and must pair every
//! acquire with exactly one later [`ConcurrencyLimiter::release`]. This lets the dispatcher hold
//! slots across spawned tasks and lets the capacity be changed at runtime.
//!
//! # Example
//!
//! ```
//! # use genbatch::concurrency::{ConcurrencyConfig, ConcurrencyLimiter};
//! let limiter = ConcurrencyLimiter::new(ConcurrencyConfig::default().with_max_concurrent(1));
//!
//! assert!(limiter.can_start());
//! limiter.acquire();
//! assert!(!limiter.can_start());
//! limiter.release();
//! assert!(limiter.can_start());
//! ```
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::notifier::{CapacityAvailable, Listeners};

/// Configuration for a [`ConcurrencyLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// The maximum number of slots that can be held at once.
    pub max_concurrent: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_concurrent: 3 }
    }
}

impl ConcurrencyConfig {
    pub const fn with_max_concurrent(self, max_concurrent: usize) -> Self {
        Self { max_concurrent }
    }
}

/// A partial update merged into the current [`ConcurrencyConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfigUpdate {
    pub max_concurrent: Option<usize>,
}

/// Point in time view of a [`ConcurrencyLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySnapshot {
    pub active: usize,
    pub max: usize,
    pub waiting: usize,
}

#[derive(Debug)]
struct LimiterState {
    active: usize,
    config: ConcurrencyConfig,
    waiters: VecDeque<oneshot::Sender<()>>,
    listeners: Listeners,
}

impl LimiterState {
    fn has_capacity(&self) -> bool {
        self.active < self.config.max_concurrent
    }

    /// Resolves the oldest waiter that is still listening. Waiters whose future has been dropped
    /// are discarded along the way.
    fn wake_oldest(&mut self) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return true;
            }
        }
        false
    }
}

#[derive(Debug)]
pub struct ConcurrencyLimiter {
    state: Mutex<LimiterState>,
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

impl ConcurrencyLimiter {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                active: 0,
                config,
                waiters: Default::default(),
                listeners: Default::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LimiterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a new unit of work may start right now.
    pub fn can_start(&self) -> bool {
        self.state().has_capacity()
    }

    /// Takes a slot without checking capacity.
    ///
    /// Callers are expected to have checked [`ConcurrencyLimiter::can_start`] or to go through
    /// [`ConcurrencyLimiter::try_acquire`].
    pub fn acquire(&self) {
        let mut state = self.state();
        state.active += 1;
        tracing::trace!(active = state.active, "Concurrency slot acquired");
    }

    /// Gives a slot back, wakes the oldest waiter if there is room and notifies every
    /// subscriber that capacity is available.
    pub fn release(&self) {
        let mut state = self.state();
        state.active = state.active.saturating_sub(1);
        tracing::trace!(active = state.active, "Concurrency slot released");
        if state.has_capacity() {
            state.wake_oldest();
        }
        state.listeners.notify_all();
    }

    /// Resolves once there is free capacity.
    ///
    /// Waiters are resumed in the order they started waiting. Resuming does not take a slot.
    pub async fn wait_for_slot(&self) {
        let receiver = {
            let mut state = self.state();
            if state.has_capacity() {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };
        // An error means the limiter was dropped, nothing is left to wait for.
        let _ = receiver.await;
    }

    /// Waits for capacity and then acquires a slot.
    ///
    /// Returns `false` without acquiring if `cancellation` is cancelled before or after waiting.
    pub async fn try_acquire(&self, cancellation: &CancellationToken) -> bool {
        if cancellation.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.wait_for_slot() => {},
            _ = cancellation.cancelled() => return false,
        }
        if cancellation.is_cancelled() {
            return false;
        }
        self.acquire();
        true
    }

    /// Merges `update` into the current configuration. When the maximum grows, as many waiters
    /// as the new headroom allows are resumed.
    pub fn update_config(&self, update: ConcurrencyConfigUpdate) {
        let mut state = self.state();
        let previous = state.config.max_concurrent;
        if let Some(max_concurrent) = update.max_concurrent {
            state.config.max_concurrent = max_concurrent;
        }
        let max = state.config.max_concurrent;
        tracing::debug!(previous, max, "Concurrency limit updated");
        if max > previous {
            let headroom = max.saturating_sub(state.active);
            for _ in 0..headroom {
                if !state.wake_oldest() {
                    break;
                }
            }
            state.listeners.notify_all();
        }
    }

    /// Zeroes the active count and resumes every waiter.
    ///
    /// Only meant as a recovery hatch when slots have leaked.
    pub fn force_reset(&self) {
        let mut state = self.state();
        tracing::warn!(
            active = state.active,
            waiting = state.waiters.len(),
            "Force resetting the concurrency limiter"
        );
        state.active = 0;
        while state.wake_oldest() {}
        state.listeners.notify_all();
    }

    /// Subscribes to capacity notifications emitted on every release.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CapacityAvailable> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.listeners.enroll(Box::new(sender));
        tracing::trace!(subscribers = state.listeners.len(), "Capacity subscriber added");
        receiver
    }

    pub fn config(&self) -> ConcurrencyConfig {
        self.state().config
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        let state = self.state();
        ConcurrencySnapshot {
            active: state.active,
            max: state.config.max_concurrent,
            waiting: state.waiters.len(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use rand::Rng;

    use super::*;

    fn limiter(max_concurrent: usize) -> Arc<ConcurrencyLimiter> {
        Arc::new(ConcurrencyLimiter::new(
            ConcurrencyConfig::default().with_max_concurrent(max_concurrent),
        ))
    }

    #[test]
    fn active_count_stays_within_bounds() {
        let limiter = limiter(4);
        let mut rng = rand::thread_rng();
        let mut held: usize = 0;

        for _ in 0..1000 {
            if rng.gen_bool(0.5) && limiter.can_start() {
                limiter.acquire();
                held += 1;
            } else {
                limiter.release();
                held = held.saturating_sub(1);
            }
            let snapshot = limiter.snapshot();
            assert_eq!(snapshot.active, held);
            assert!(snapshot.active <= snapshot.max);
            assert_eq!(limiter.can_start(), snapshot.active < snapshot.max);
        }
    }

    #[test]
    fn release_never_goes_negative() {
        let limiter = limiter(1);

        limiter.release();
        limiter.release();

        assert_eq!(limiter.snapshot().active, 0);
        assert!(limiter.can_start());
    }

    #[tokio::test]
    async fn wait_for_slot_resolves_immediately_with_capacity() {
        let limiter = limiter(1);

        tokio::time::timeout(Duration::from_millis(10), limiter.wait_for_slot())
            .await
            .expect("slot should be available");
    }

    #[tokio::test]
    async fn release_resumes_the_oldest_waiter_first() {
        let limiter = limiter(1);
        limiter.acquire();

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        for waiter in 0..3 {
            let limiter = limiter.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                limiter.wait_for_slot().await;
                let _ = order_tx.send(waiter);
            });
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.snapshot().waiting, 3);

        limiter.release();
        assert_eq!(order_rx.recv().await, Some(0));
        limiter.acquire();
        limiter.release();
        assert_eq!(order_rx.recv().await, Some(1));
        limiter.acquire();
        limiter.release();
        assert_eq!(order_rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn try_acquire_respects_cancellation() {
        let limiter = limiter(1);
        let token = CancellationToken::new();
        token.cancel();

        assert!(!limiter.try_acquire(&token).await);
        assert_eq!(limiter.snapshot().active, 0);
    }

    #[tokio::test]
    async fn try_acquire_cancelled_while_waiting() {
        let limiter = limiter(1);
        limiter.acquire();
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let limiter = limiter.clone();
            let token = token.clone();
            async move { limiter.try_acquire(&token).await }
        });
        tokio::task::yield_now().await;
        token.cancel();

        assert!(!handle.await.unwrap());
        assert_eq!(limiter.snapshot().active, 1);
    }

    #[tokio::test]
    async fn try_acquire_takes_a_slot_after_release() {
        let limiter = limiter(1);
        limiter.acquire();
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let limiter = limiter.clone();
            let token = token.clone();
            async move { limiter.try_acquire(&token).await }
        });
        tokio::task::yield_now().await;
        limiter.release();

        assert!(handle.await.unwrap());
        assert_eq!(limiter.snapshot().active, 1);
    }

    #[tokio::test]
    async fn raising_the_limit_resumes_waiters() {
        let limiter = limiter(1);
        limiter.acquire();

        let handles = (0..3)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.wait_for_slot().await })
            })
            .collect::<Vec<_>>();
        tokio::task::yield_now().await;
        assert_eq!(limiter.snapshot().waiting, 3);

        limiter.update_config(ConcurrencyConfigUpdate {
            max_concurrent: Some(3),
        });

        assert_eq!(limiter.snapshot().waiting, 1);
        assert_eq!(limiter.config().max_concurrent, 3);
        limiter.force_reset();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn force_reset_clears_everything() {
        let limiter = limiter(1);
        limiter.acquire();
        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.wait_for_slot().await }
        });
        tokio::task::yield_now().await;

        limiter.force_reset();

        waiter.await.unwrap();
        assert_eq!(
            limiter.snapshot(),
            ConcurrencySnapshot {
                active: 0,
                max: 1,
                waiting: 0
            }
        );
    }

    #[tokio::test]
    async fn release_notifies_subscribers() {
        let limiter = limiter(1);
        let mut capacity = limiter.subscribe();
        limiter.acquire();

        limiter.release();

        assert_eq!(capacity.try_recv(), Ok(CapacityAvailable));
    }
}
