//! Sliding window call rate limiter.
//!
//! Every admitted call is recorded with [`RateLimiter::record_call`]. The limiter permits a new
//! call while fewer than `max_calls` calls were recorded within the trailing `window`. Expired
//! calls are pruned whenever the limiter is queried, there is no background timer.
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Configuration for a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum number of calls within the window.
    pub max_calls: usize,
    /// Length of the trailing window.
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub const fn with_max_calls(self, max_calls: usize) -> Self {
        Self { max_calls, ..self }
    }

    pub const fn with_window(self, window: Duration) -> Self {
        Self { window, ..self }
    }
}

/// A partial update merged into the current [`RateLimitConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitConfigUpdate {
    pub max_calls: Option<usize>,
    pub window: Option<Duration>,
}

/// Point in time view of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    /// Calls that can be made right now.
    pub available: usize,
    pub max: usize,
    #[serde(with = "duration_ms")]
    pub next_available_in: Duration,
}

#[derive(Debug)]
struct Window {
    config: RateLimitConfig,
    calls: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.calls.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn next_available_in(&self, now: Instant) -> Duration {
        if self.calls.len() < self.config.max_calls {
            return Duration::ZERO;
        }
        // The call that has to leave the window before another one is permitted.
        let blocking = self.calls.len() - self.config.max_calls;
        self.calls
            .get(blocking)
            .map(|call| (*call + self.config.window).saturating_duration_since(now))
            .unwrap_or(self.config.window)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<Window>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: Mutex::new(Window {
                config,
                calls: Default::default(),
            }),
        }
    }

    fn pruned(&self) -> (MutexGuard<'_, Window>, Instant) {
        let now = Instant::now();
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        window.prune(now);
        (window, now)
    }

    pub fn can_make_call(&self) -> bool {
        let (window, _) = self.pruned();
        window.calls.len() < window.config.max_calls
    }

    /// Records a call at the current instant. Called once per admitted unit of work.
    pub fn record_call(&self) {
        let (mut window, now) = self.pruned();
        window.calls.push_back(now);
    }

    /// Time until a new call is permitted, zero when one is permitted now.
    pub fn next_available_in(&self) -> Duration {
        let (window, now) = self.pruned();
        window.next_available_in(now)
    }

    pub fn update_config(&self, update: RateLimitConfigUpdate) {
        let (mut window, now) = self.pruned();
        if let Some(max_calls) = update.max_calls {
            window.config.max_calls = max_calls;
        }
        if let Some(duration) = update.window {
            window.config.window = duration;
        }
        window.prune(now);
        tracing::debug!(config = ?window.config, "Rate limit updated");
    }

    pub fn config(&self) -> RateLimitConfig {
        self.pruned().0.config
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let (window, now) = self.pruned();
        RateLimitSnapshot {
            available: window.config.max_calls.saturating_sub(window.calls.len()),
            max: window.config.max_calls,
            next_available_in: window.next_available_in(now),
        }
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn limiter(max_calls: usize, window: Duration) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::default()
                .with_max_calls(max_calls)
                .with_window(window),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn permits_calls_below_the_ceiling() {
        let limiter = limiter(2, Duration::from_secs(60));

        assert!(limiter.can_make_call());
        limiter.record_call();
        assert!(limiter.can_make_call());
        limiter.record_call();
        assert!(!limiter.can_make_call());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_when_the_oldest_call_leaves_the_window() {
        let limiter = limiter(2, Duration::from_secs(60));
        limiter.record_call();
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.record_call();

        assert_eq!(limiter.next_available_in(), Duration::from_secs(50));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(limiter.can_make_call());
        assert_eq!(limiter.next_available_in(), Duration::ZERO);
        assert_eq!(limiter.snapshot().available, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reflects_the_window() {
        let limiter = limiter(3, Duration::from_secs(1));
        limiter.record_call();

        assert_eq!(
            limiter.snapshot(),
            RateLimitSnapshot {
                available: 2,
                max: 3,
                next_available_in: Duration::ZERO,
            }
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.snapshot().available, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn lowering_the_ceiling_blocks_immediately() {
        let limiter = limiter(3, Duration::from_secs(60));
        limiter.record_call();
        tokio::time::advance(Duration::from_secs(20)).await;
        limiter.record_call();

        limiter.update_config(RateLimitConfigUpdate {
            max_calls: Some(1),
            window: None,
        });

        assert!(!limiter.can_make_call());
        // Both calls have to leave before a third is permitted.
        assert_eq!(limiter.next_available_in(), Duration::from_secs(60));
    }

    #[test]
    fn config_reads_window_in_millis() {
        let config: RateLimitConfig =
            serde_json::from_str(r#"{"max_calls": 5, "window_ms": 1500}"#).unwrap();

        assert_eq!(
            config,
            RateLimitConfig::default()
                .with_max_calls(5)
                .with_window(Duration::from_millis(1500))
        );
    }
}
