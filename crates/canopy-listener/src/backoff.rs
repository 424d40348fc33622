use std::time::Duration;

/// Exponential polling back-off between a minimum and a maximum interval.
#[derive(Debug, Clone)]
pub struct Backoff {
  min: Duration,
  max: Duration,
  current: Duration,
}

impl Backoff {
  pub fn new(min: Duration, max: Duration) -> Self {
    let max = max.max(min);
    Self {
      min,
      max,
      current: min,
    }
  }

  /// The delay to wait now. Each call doubles the following delay up to the
  /// maximum.
  pub fn next_delay(&mut self) -> Duration {
    let delay = self.current;
    self.current = (self.current * 2).min(self.max);
    delay
  }

  pub fn reset(&mut self) {
    self.current = self.min;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn doubles_up_to_maximum_and_resets() {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));

    let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
    assert_eq!(delays, vec![100, 200, 400, 500, 500]);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
  }
}
