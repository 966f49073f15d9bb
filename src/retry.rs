use std::time::Duration;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
  Fixed(Duration),
  /// `base * 2^(attempt - 1)`, never more than `cap`.
  Exponential { base: Duration, cap: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  Retry { attempt: i32, delay: Duration },
  Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub backoff: Backoff,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::fixed(DEFAULT_RETRY_DELAY)
  }
}

impl RetryPolicy {
  pub fn fixed(delay: Duration) -> Self {
    Self { backoff: Backoff::Fixed(delay) }
  }

  pub fn exponential(base: Duration, cap: Duration) -> Self {
    Self { backoff: Backoff::Exponential { base, cap } }
  }

  /// `retries` is the count already consumed when the failure happened.
  pub fn decide(&self, retries: i32, max_retries: i32) -> RetryDecision {
    if retries < max_retries {
      let attempt = retries + 1;
      RetryDecision::Retry { attempt, delay: self.delay_for(attempt) }
    } else {
      RetryDecision::Exhausted
    }
  }

  pub fn delay_for(&self, attempt: i32) -> Duration {
    match self.backoff {
      Backoff::Fixed(delay) => delay,
      Backoff::Exponential { base, cap } => {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        base.checked_mul(1u32 << exponent).map_or(cap, |delay| delay.min(cap))
      }
    }
  }
}
