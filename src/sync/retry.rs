use std::time::Duration;

use crate::config::SyncConfig;

/// Bounded exponential backoff between automatic sync passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Failures an operation may accumulate before it becomes terminal
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from(&SyncConfig::default())
  }
}

impl From<&SyncConfig> for RetryPolicy {
  fn from(config: &SyncConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      base_delay: Duration::from_secs(config.base_delay_secs),
      max_delay: Duration::from_secs(config.max_delay_secs),
    }
  }
}

impl RetryPolicy {
  /// Delay before the next pass after `attempt` consecutive incomplete passes.
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_delay_doubles_then_caps() {
    let policy = RetryPolicy {
      max_retries: 5,
      base_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(60),
    };
    let delays: Vec<u64> = (0..7).map(|n| policy.delay(n).as_secs()).collect();
    assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
  }

  #[test]
  fn test_huge_attempt_does_not_overflow() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay(200), policy.max_delay);
  }
}
