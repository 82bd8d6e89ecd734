use std::time::Duration;

use imagegate_contracts::errors::ClassifiedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Decides whether a failed Transport+Normalizer step is worth repeating.
///
/// Only transient failures retry: timeouts and connection errors back off
/// exponentially from `base_delay`, rate limits wait at least
/// `rate_limit_delay` (or the upstream `Retry-After`, when larger). Every other
/// classification is a request or configuration problem and gives up at once.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per slot, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            rate_limit_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub const fn with_rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn should_retry(&self, error: &ClassifiedError, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match error {
            ClassifiedError::Timeout(_) | ClassifiedError::Transport(_) => {
                RetryDecision::RetryAfter(self.backoff(attempt))
            }
            ClassifiedError::RateLimited { retry_after, .. } => {
                let ceiling = self.max_delay.max(self.rate_limit_delay);
                let delay = self
                    .backoff(attempt)
                    .max(self.rate_limit_delay)
                    .max(retry_after.unwrap_or_default())
                    .min(ceiling);
                RetryDecision::RetryAfter(delay)
            }
            ClassifiedError::AuthError(_)
            | ClassifiedError::MalformedResponse(_)
            | ClassifiedError::UpstreamRejected(_)
            | ClassifiedError::DecodeFailure(_)
            | ClassifiedError::UnknownProvider(_)
            | ClassifiedError::Cancelled(_) => RetryDecision::GiveUp,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use imagegate_contracts::errors::ClassifiedError;

    use super::{RetryDecision, RetryPolicy};

    fn rate_limited(retry_after: Option<Duration>) -> ClassifiedError {
        ClassifiedError::RateLimited {
            message: "429".to_string(),
            retry_after,
        }
    }

    #[test]
    fn timeouts_back_off_exponentially_until_the_ceiling() {
        let policy = RetryPolicy::new()
            .with_max_attempts(4)
            .with_base_delay(Duration::from_millis(100));
        let err = ClassifiedError::Timeout("deadline".to_string());
        assert_eq!(
            policy.should_retry(&err, 1),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.should_retry(&err, 2),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            policy.should_retry(&err, 3),
            RetryDecision::RetryAfter(Duration::from_millis(400))
        );
        assert_eq!(policy.should_retry(&err, 4), RetryDecision::GiveUp);
    }

    #[test]
    fn transport_failures_are_retryable() {
        let policy = RetryPolicy::new();
        let err = ClassifiedError::Transport("connection refused".to_string());
        assert!(matches!(
            policy.should_retry(&err, 1),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn rate_limits_wait_at_least_the_longer_minimum() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(10))
            .with_rate_limit_delay(Duration::from_secs(2));
        assert_eq!(
            policy.should_retry(&rate_limited(None), 1),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.should_retry(&rate_limited(Some(Duration::from_secs(7))), 1),
            RetryDecision::RetryAfter(Duration::from_secs(7))
        );
        assert_eq!(
            policy.should_retry(&rate_limited(Some(Duration::from_secs(600))), 1),
            RetryDecision::RetryAfter(Duration::from_secs(30))
        );
        assert_eq!(
            policy.should_retry(&rate_limited(None), 3),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn request_level_failures_never_retry() {
        let policy = RetryPolicy::new().with_max_attempts(10);
        let errors = [
            ClassifiedError::AuthError("invalid api key".to_string()),
            ClassifiedError::MalformedResponse("not json".to_string()),
            ClassifiedError::UpstreamRejected("nsfw".to_string()),
            ClassifiedError::DecodeFailure("truncated".to_string()),
            ClassifiedError::UnknownProvider("x".to_string()),
            ClassifiedError::Cancelled("stop".to_string()),
        ];
        for err in errors {
            assert_eq!(policy.should_retry(&err, 1), RetryDecision::GiveUp, "{err}");
        }
    }

    #[test]
    fn backoff_is_capped_by_max_delay() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
    }
}
