use crate::config::RetryConfig;
use std::time::Duration;
use time::OffsetDateTime;

/// What to do after the `n`th consecutive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Retry(Duration),
    CoolDown(Duration),
}

/// Exponential backoff with a cool-down once the retry budget is spent.
///
/// The delay after the `n`th consecutive failure is `base * 2^(n-1)`. When `n`
/// reaches `max_retries` the scheduler waits out `cooldown`, resets the
/// counter and starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
    pub cooldown: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl BackoffPolicy {
    #[must_use]
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_retries: config.max_retries,
            cooldown: Duration::from_secs(config.cooldown_secs),
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// `retry_count` is the counter after recording the failure.
    #[must_use]
    pub fn after_failure(&self, retry_count: u32) -> NextStep {
        if self.is_exhausted(retry_count) {
            NextStep::CoolDown(self.cooldown)
        } else {
            NextStep::Retry(self.delay_for(retry_count))
        }
    }

    #[must_use]
    pub const fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// How much of the cool-down is left, given when the last failure happened.
    /// A missing timestamp means the full cool-down.
    #[must_use]
    pub fn remaining_cooldown(&self, last_attempt_at: Option<OffsetDateTime>, now: OffsetDateTime) -> Duration {
        let Some(last) = last_attempt_at else {
            return self.cooldown;
        };
        let elapsed = Duration::try_from(now - last).unwrap_or(Duration::ZERO);
        self.cooldown.saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cooldown() {
        let policy = BackoffPolicy::default();

        let steps: Vec<_> = (1..=5).map(|n| policy.after_failure(n)).collect();
        assert_eq!(
            steps,
            vec![
                NextStep::Retry(Duration::from_secs(5)),
                NextStep::Retry(Duration::from_secs(10)),
                NextStep::Retry(Duration::from_secs(20)),
                NextStep::Retry(Duration::from_secs(40)),
                NextStep::CoolDown(Duration::from_secs(3600)),
            ]
        );
    }

    #[test]
    fn test_delay_saturates() {
        let policy = BackoffPolicy { base_delay: Duration::from_secs(5), max_retries: u32::MAX, cooldown: Duration::ZERO };
        assert_eq!(policy.delay_for(64), Duration::from_secs(5).saturating_mul(u32::MAX));
    }

    #[test]
    fn test_remaining_cooldown() {
        let policy = BackoffPolicy::default();
        let now = OffsetDateTime::now_utc();

        assert_eq!(policy.remaining_cooldown(None, now), Duration::from_secs(3600));
        assert_eq!(
            policy.remaining_cooldown(Some(now - time::Duration::minutes(20)), now),
            Duration::from_secs(2400)
        );
        assert_eq!(policy.remaining_cooldown(Some(now - time::Duration::hours(3)), now), Duration::ZERO);
        // Clock moved backwards
        assert_eq!(
            policy.remaining_cooldown(Some(now + time::Duration::minutes(5)), now),
            Duration::from_secs(3600)
        );
    }
}
