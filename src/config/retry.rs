//! Retry policy for provider failures
//!
//! A check whose provider call errors (or returns an `error`) is re-dispatched
//! up to `max` more times, sleeping between attempts according to the backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration attached to a check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first one
    #[serde(default = "default_max", alias = "max_attempts")]
    pub max: u32,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: default_max(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub mode: BackoffMode,

    /// Delay before the first retry
    #[serde(default = "default_delay", with = "humantime_serde", alias = "initial_delay")]
    pub delay: Duration,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Add up to ±25% random jitter to each delay
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            mode: BackoffMode::default(),
            delay: default_delay(),
            max_delay: default_max_delay(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.backoff.delay;
        let delay = match self.backoff.mode {
            BackoffMode::Fixed => base,
            BackoffMode::Linear => base * attempt,
            BackoffMode::Exponential => {
                let multiplier = 2f64.powi(attempt as i32 - 1);
                Duration::from_secs_f64(base.as_secs_f64() * multiplier)
            }
        };
        let delay = delay.min(self.backoff.max_delay);
        if self.backoff.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let range = delay.as_secs_f64() * 0.25;
    let jitter = rng.random_range(-range..=range);
    Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
}

fn default_max() -> u32 {
    1
}

fn default_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: BackoffMode, delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max: 3,
            backoff: BackoffConfig {
                mode,
                delay: Duration::from_millis(delay_ms),
                max_delay: Duration::from_secs(1),
                jitter: false,
            },
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let p = policy(BackoffMode::Fixed, 100);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy(BackoffMode::Exponential, 100);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn test_linear_backoff() {
        let p = policy(BackoffMode::Linear, 100);
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
    }

    #[test]
    fn test_deserialize_humantime() {
        let p: RetryPolicy =
            serde_yaml::from_str("max: 2\nbackoff:\n  mode: fixed\n  delay: 250ms\n").unwrap();
        assert_eq!(p.max, 2);
        assert_eq!(p.backoff.mode, BackoffMode::Fixed);
        assert_eq!(p.backoff.delay, Duration::from_millis(250));
    }
}
