use std::time::Duration;

/// Exponential reconnect delays with a retry ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
  initial: Duration,
  max: Duration,
  max_retries: u32,
  attempts: u32,
}

impl Backoff {
  pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
    Self {
      initial,
      max,
      max_retries,
      attempts: 0,
    }
  }

  /// Delay before the next attempt, or `None` once the ceiling is reached.
  pub fn next_delay(&mut self) -> Option<Duration> {
    if self.attempts >= self.max_retries {
      return None;
    }
    let factor = 1u32 << self.attempts.min(16);
    self.attempts += 1;
    Some(self.initial.saturating_mul(factor).min(self.max))
  }

  /// Forget past failures after a successful connection.
  pub fn reset(&mut self) {
    self.attempts = 0;
  }

  pub fn attempts(&self) -> u32 {
    self.attempts
  }
}
