//! Backoff strategies used to delay the re-queue of a failed batch.
//!
//! The dispatcher derives its strategy from [`crate::policy::RetryPolicy`], but the types here
//! can be used directly when a custom schedule is needed.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use genbatch::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1))
//!     .with_multiplier(2.0)
//!     .with_max(TimeDelta::seconds(10));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(1));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(5), TimeDelta::seconds(10));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of consecutive failures returns the [`TimeDelta`] to wait before the
    /// batch should be queued again.
    fn backoff(&self, failures: u32) -> TimeDelta;
}

/// Exponential backoff strategy.
///
/// The first failure waits `base`, every further failure multiplies the wait by `multiplier`.
/// It is advisable to set the maximum backoff using [`BackoffStrategy::with_max`].
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::exponential`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exponential {
    base: TimeDelta,
    multiplier: f64,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, failures: u32) -> TimeDelta {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base.num_milliseconds() as f64 * self.multiplier.powi(exponent);
        let mut millis = if millis.is_finite() && millis < i64::MAX as f64 {
            millis.round() as i64
        } else {
            i64::MAX
        };
        if let Some(max) = self.max {
            millis = millis.min(max.num_milliseconds());
        }
        TimeDelta::try_milliseconds(millis).unwrap_or(TimeDelta::MAX)
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// A random jitter in milliseconds added to the backoff in the range
    /// `-delta =< jitter =< delta`.
    Absolute(i64),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.saturating_abs(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio.abs()).round() as i64,
        };
        if milliseconds == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        TimeDelta::try_milliseconds(jitter)
            .and_then(|jitter| value.checked_add(&jitter))
            .unwrap_or(value)
    }
}

/// A backoff strategy optionally modified by a [`Jitter`] and clamped below by a minimum.
///
/// # Example
///
/// ```
/// # use genbatch::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
///     .with_max(TimeDelta::seconds(30))
///     .with_jitter(Jitter::Absolute(500));
///
/// assert!(strategy.backoff(1) >= TimeDelta::milliseconds(1500));
/// assert!(strategy.backoff(1) <= TimeDelta::milliseconds(2500));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] with an exponential backoff strategy doubling on each
    /// failure. The growth rate can be changed with [`BackoffStrategy::with_multiplier`].
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential {
            base,
            multiplier: 2.0,
            max: None,
        })
    }

    /// Sets the factor applied to the backoff for every additional failure.
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.strategy.multiplier = multiplier;
        self
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Creates a [`BackoffStrategy`] with a the given backoff strategy.
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Add a jitter to the backoff strategy see [`Jitter`] for more information about how this
    /// affects the strategy.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. Useful with a large jitter to avoid very short delays.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, failures: u32) -> TimeDelta {
        let mut backoff = self.strategy.backoff(failures);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exponential_backoff() {
        let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(100));

        for i in 1..10 {
            assert_eq!(
                strategy.backoff(i).num_milliseconds(),
                100 * 2_i64.pow(i - 1)
            );
        }
    }

    #[test]
    fn exponential_backoff_with_multiplier() {
        let strategy =
            BackoffStrategy::exponential(TimeDelta::milliseconds(1000)).with_multiplier(1.5);

        assert_eq!(strategy.backoff(1), TimeDelta::milliseconds(1000));
        assert_eq!(strategy.backoff(2), TimeDelta::milliseconds(1500));
        assert_eq!(strategy.backoff(3), TimeDelta::milliseconds(2250));
    }

    #[test]
    fn zero_failures_is_treated_as_first() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));

        assert_eq!(strategy.backoff(0), TimeDelta::seconds(1));
    }

    #[test]
    fn exponential_backoff_with_max() {
        let max = TimeDelta::seconds(30);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1)).with_max(max);

        for i in 1..200 {
            assert!(strategy.backoff(i) <= max);
        }
        assert_eq!(strategy.backoff(199), max);
    }

    #[test]
    fn exponential_backoff_with_absolute_jitter() {
        let delay = TimeDelta::seconds(4);
        let strategy = BackoffStrategy::exponential(delay).with_jitter(Jitter::Absolute(1000));

        for _ in 1..100 {
            let backoff = strategy.backoff(1);
            assert!(backoff >= delay - TimeDelta::seconds(1));
            assert!(backoff <= delay + TimeDelta::seconds(1));
        }
    }

    #[test]
    fn exponential_backoff_with_relative_jitter() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(10))
            .with_jitter(Jitter::Relative(0.1));

        for _ in 1..100 {
            let backoff = strategy.backoff(2);
            assert!(backoff >= TimeDelta::seconds(18));
            assert!(backoff <= TimeDelta::seconds(22));
        }
    }

    #[test]
    fn exponential_backoff_with_jitter_min() {
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1))
            .with_jitter(Jitter::Absolute(10_000))
            .with_min(min);

        for _ in 1..100 {
            assert!(strategy.backoff(1) >= min);
        }
    }

    #[test]
    fn extreme_absolute_jitter_is_saturated() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1))
            .with_jitter(Jitter::Absolute(i64::MIN));

        for _ in 1..100 {
            assert!(strategy.backoff(1) >= TimeDelta::zero());
        }
    }
}
