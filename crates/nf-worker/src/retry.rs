//! Retry Policy Resolver
//!
//! Maps a failure classification and attempt number to the delay before the
//! next attempt, or to no-retry. AUTH and PERMANENT never retry; RATE_LIMIT
//! backs off exponentially with full jitter; TRANSIENT uses a linear ramp.

use nf_common::{FailureClassification, NotificationChannel};
use nf_config::RetryConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for TRANSIENT backoff
    backoff_base: Duration,
    /// Cap for TRANSIENT backoff
    backoff_cap: Duration,
    /// Base delay for RATE_LIMIT exponential backoff
    rate_limit_base: Duration,
    /// Cap for RATE_LIMIT exponential backoff
    rate_limit_cap: Duration,
    max_attempts: nf_config::MaxAttempts,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            rate_limit_base: Duration::from_millis(config.rate_limit_base_ms),
            rate_limit_cap: Duration::from_millis(config.rate_limit_cap_ms),
            max_attempts: config.max_attempts.clone(),
        }
    }

    pub fn max_attempts(&self, channel: NotificationChannel) -> u32 {
        self.max_attempts.for_channel(channel)
    }

    /// Delay before the next attempt, or None when the classification does
    /// not retry. `attempt` is the 1-based attempt that just failed.
    ///
    /// A provider-supplied `retry_after` (e.g. a Retry-After header) takes
    /// precedence over the computed backoff, clamped to the classification's
    /// cap. Computed delays never undercut the configured base, so the next
    /// attempt is observably no earlier than base after the failure.
    pub fn next_delay(
        &self,
        classification: FailureClassification,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        match classification {
            FailureClassification::Auth | FailureClassification::Permanent => None,
            FailureClassification::RateLimit => {
                if let Some(hint) = retry_after {
                    return Some(hint.min(self.rate_limit_cap));
                }
                // Exponential with full jitter above the base
                let exp = self
                    .rate_limit_base
                    .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)));
                let capped = exp.min(self.rate_limit_cap).max(self.rate_limit_base);
                let jittered = if capped > self.rate_limit_base {
                    let span = (capped - self.rate_limit_base).as_millis() as u64;
                    let jitter = rand::thread_rng().gen_range(0..=span);
                    self.rate_limit_base + Duration::from_millis(jitter)
                } else {
                    capped
                };
                Some(jittered)
            }
            FailureClassification::Transient => {
                if let Some(hint) = retry_after {
                    return Some(hint.min(self.backoff_cap));
                }
                let delay = self.backoff_base.saturating_mul(attempt.min(64));
                Some(delay.min(self.backoff_cap).max(self.backoff_base))
            }
        }
    }

    /// Whether another attempt may be scheduled after `attempt` failures.
    pub fn allows_retry(
        &self,
        classification: FailureClassification,
        channel: NotificationChannel,
        attempt: u32,
    ) -> bool {
        classification.is_retryable() && attempt < self.max_attempts(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig::default())
    }

    #[test]
    fn test_auth_and_permanent_never_retry() {
        let policy = policy();
        for attempt in 1..=10 {
            assert!(policy
                .next_delay(FailureClassification::Auth, attempt, None)
                .is_none());
            assert!(policy
                .next_delay(FailureClassification::Permanent, attempt, None)
                .is_none());
            assert!(!policy.allows_retry(
                FailureClassification::Auth,
                NotificationChannel::Email,
                attempt
            ));
        }
    }

    #[test]
    fn test_auth_ignores_provider_retry_after() {
        let policy = policy();
        assert!(policy
            .next_delay(
                FailureClassification::Auth,
                1,
                Some(Duration::from_secs(30))
            )
            .is_none());
    }

    #[test]
    fn test_transient_delay_grows_and_caps() {
        let policy = policy();
        let d1 = policy
            .next_delay(FailureClassification::Transient, 1, None)
            .unwrap();
        let d3 = policy
            .next_delay(FailureClassification::Transient, 3, None)
            .unwrap();
        assert!(d1 >= Duration::from_secs(2));
        assert!(d3 > d1);

        let huge = policy
            .next_delay(FailureClassification::Transient, 1000, None)
            .unwrap();
        assert!(huge <= Duration::from_secs(300));
    }

    #[test]
    fn test_rate_limit_delay_stays_within_bounds() {
        let policy = policy();
        for attempt in 1..=12 {
            let delay = policy
                .next_delay(FailureClassification::RateLimit, attempt, None)
                .unwrap();
            assert!(delay >= Duration::from_secs(2), "attempt {attempt}: {delay:?}");
            assert!(delay <= Duration::from_secs(900), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn test_provider_retry_after_wins_over_backoff() {
        let policy = policy();

        // The provider's stated delay is used as-is, even below the base
        let delay = policy
            .next_delay(
                FailureClassification::RateLimit,
                1,
                Some(Duration::from_secs(30)),
            )
            .unwrap();
        assert_eq!(delay, Duration::from_secs(30));

        let delay = policy
            .next_delay(
                FailureClassification::RateLimit,
                5,
                Some(Duration::from_secs(1)),
            )
            .unwrap();
        assert_eq!(delay, Duration::from_secs(1));

        // But never beyond the cap
        let delay = policy
            .next_delay(
                FailureClassification::RateLimit,
                1,
                Some(Duration::from_secs(86_400)),
            )
            .unwrap();
        assert_eq!(delay, Duration::from_secs(900));

        let delay = policy
            .next_delay(
                FailureClassification::Transient,
                1,
                Some(Duration::from_secs(86_400)),
            )
            .unwrap();
        assert_eq!(delay, Duration::from_secs(300));
    }

    #[test]
    fn test_ceiling_stops_retries() {
        let policy = policy();
        assert!(policy.allows_retry(
            FailureClassification::Transient,
            NotificationChannel::Email,
            4
        ));
        assert!(!policy.allows_retry(
            FailureClassification::Transient,
            NotificationChannel::Email,
            5
        ));
    }
}
