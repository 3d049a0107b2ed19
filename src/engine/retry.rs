use crate::config::DispatcherConfig;
use crate::exchange::adapter::BackendError;
use crate::exchange::router::NoCapacity;
use crate::model::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay_ms: u64 },
    GiveUp,
}

/// Bounded exponential backoff shared by NoCapacity re-queues and transient
/// backend failures. `retries` is the number of retries already spent by the
/// logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
        }
    }
}

impl From<&DispatcherConfig> for RetryPolicy {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2x base, 4x base...
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        let exp = retry.saturating_sub(1).min(32);
        self.backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms.max(self.backoff_base_ms))
    }

    fn retry_after(&self, retries: u32, floor_ms: Option<u64>) -> RetryDecision {
        if retries >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let backoff = self.backoff_ms(retries + 1);
        RetryDecision::Retry {
            delay_ms: backoff.max(floor_ms.unwrap_or(0)),
        }
    }

    /// Only High priority waits for capacity; the rest is pushed back to the
    /// producer immediately.
    pub fn on_no_capacity(
        &self,
        priority: Priority,
        retries: u32,
        no_capacity: &NoCapacity,
    ) -> RetryDecision {
        if priority != Priority::High {
            return RetryDecision::GiveUp;
        }
        self.retry_after(retries, no_capacity.retry_after_ms)
    }

    pub fn on_backend_error(&self, error: &BackendError, retries: u32) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::GiveUp;
        }
        self.retry_after(retries, error.retry_after_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::router::NoCapacityReason;

    fn no_capacity(retry_after_ms: Option<u64>) -> NoCapacity {
        NoCapacity {
            reason: NoCapacityReason::RateLimited,
            retry_after_ms,
            candidates: 2,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 500,
        };
        assert_eq!(policy.backoff_ms(1), 100);
        assert_eq!(policy.backoff_ms(2), 200);
        assert_eq!(policy.backoff_ms(3), 400);
        assert_eq!(policy.backoff_ms(4), 500);
        assert_eq!(policy.backoff_ms(60), 500);
    }

    #[test]
    fn test_no_capacity_only_retries_high() {
        let policy = RetryPolicy::default();
        let nc = no_capacity(None);
        assert_eq!(
            policy.on_no_capacity(Priority::High, 0, &nc),
            RetryDecision::Retry { delay_ms: 100 }
        );
        assert_eq!(policy.on_no_capacity(Priority::Medium, 0, &nc), RetryDecision::GiveUp);
        assert_eq!(policy.on_no_capacity(Priority::Low, 0, &nc), RetryDecision::GiveUp);
        assert_eq!(policy.on_no_capacity(Priority::High, 3, &nc), RetryDecision::GiveUp);
    }

    #[test]
    fn test_window_reset_floors_the_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.on_no_capacity(Priority::High, 1, &no_capacity(Some(750))),
            RetryDecision::Retry { delay_ms: 750 }
        );
    }

    #[test]
    fn test_backend_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.on_backend_error(&BackendError::Network("reset".into()), 1),
            RetryDecision::Retry { delay_ms: 200 }
        );
        assert_eq!(
            policy.on_backend_error(
                &BackendError::Throttled {
                    retry_after_ms: Some(1_500)
                },
                0
            ),
            RetryDecision::Retry { delay_ms: 1_500 }
        );
        assert_eq!(
            policy.on_backend_error(&BackendError::Rejected("qty".into()), 0),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.on_backend_error(&BackendError::Timeout(50), 3),
            RetryDecision::GiveUp
        );
    }
}
