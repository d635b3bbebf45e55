//! Reconnect backoff policies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maps the number of consecutive failed attempts to the wait before the
/// next attempt. `retry_count` starts at 1.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Always wait the same interval.
    Constant(Duration),
    /// `min(start + (retry_count - 1) * step, max)`.
    Linear {
        start: Duration,
        step: Duration,
        max: Duration,
    },
    /// Caller-supplied function.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryPolicy {
    pub fn constant(interval: Duration) -> Self {
        RetryPolicy::Constant(interval)
    }

    pub fn linear(start: Duration, step: Duration, max: Duration) -> Self {
        RetryPolicy::Linear { start, step, max }
    }

    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        RetryPolicy::Custom(Arc::new(f))
    }

    /// Interval to sleep after the `retry_count`-th consecutive failure.
    pub fn interval(&self, retry_count: u32) -> Duration {
        match self {
            RetryPolicy::Constant(interval) => *interval,
            RetryPolicy::Linear { start, step, max } => {
                let steps = retry_count.saturating_sub(1);
                step.checked_mul(steps)
                    .and_then(|grown| start.checked_add(grown))
                    .map_or(*max, |interval| interval.min(*max))
            }
            RetryPolicy::Custom(f) => f(retry_count),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Constant(Duration::from_secs(1))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Constant(interval) => f.debug_tuple("Constant").field(interval).finish(),
            RetryPolicy::Linear { start, step, max } => f
                .debug_struct("Linear")
                .field("start", start)
                .field("step", step)
                .field("max", max)
                .finish(),
            RetryPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_one_second() {
        let policy = RetryPolicy::default();
        for n in 1..10 {
            assert_eq!(policy.interval(n), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_linear_with_cap() {
        let policy = RetryPolicy::linear(
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(10),
        );
        assert_eq!(policy.interval(1), Duration::from_secs(2));
        assert_eq!(policy.interval(2), Duration::from_secs(5));
        assert_eq!(policy.interval(3), Duration::from_secs(8));
        assert_eq!(policy.interval(4), Duration::from_secs(10));
        assert_eq!(policy.interval(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_custom() {
        let policy = RetryPolicy::custom(|n| Duration::from_millis(100 * u64::from(n)));
        assert_eq!(policy.interval(3), Duration::from_millis(300));
        assert_eq!(format!("{policy:?}"), "Custom(..)");
    }
}
