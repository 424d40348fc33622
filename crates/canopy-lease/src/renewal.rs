//! Background renewal of leases and message visibility.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Chooses the delay before the next renewal attempt.
pub trait DelayStrategy: Send + 'static {
  fn next_delay(&mut self, succeeded: bool) -> Duration;
}

/// Renews at the normal interval while renewals succeed. After consecutive
/// failures the delay shrinks to `normal / (failures + 1)`, never dropping
/// below the minimum.
#[derive(Debug, Clone)]
pub struct LinearSpeedupStrategy {
  normal: Duration,
  minimum: Duration,
  failures: u32,
}

impl LinearSpeedupStrategy {
  pub fn new(normal: Duration, minimum: Duration) -> Self {
    Self {
      normal: normal.max(minimum),
      minimum,
      failures: 0,
    }
  }

  pub fn normal(&self) -> Duration {
    self.normal
  }
}

impl DelayStrategy for LinearSpeedupStrategy {
  fn next_delay(&mut self, succeeded: bool) -> Duration {
    if succeeded {
      self.failures = 0;
      return self.normal;
    }
    self.failures = self.failures.saturating_add(1);
    (self.normal / (self.failures + 1)).max(self.minimum)
  }
}

/// Result of one renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
  Renewed,
  /// A transient failure; try again sooner.
  Retry,
  /// The protected resource is gone. The timer stops and `lost()` fires.
  Lost,
}

/// Periodic renewal task bound to a unit of work.
///
/// The task stops when [`RenewalTimer::stop`] is called, when the parent
/// cancellation token fires, or when the timer is dropped. A renewal already
/// in flight runs to completion, and [`RenewalTimer::stop`] waits for it, so
/// whatever the renewal wrote back is visible once `stop` returns.
pub struct RenewalTimer {
  stop: CancellationToken,
  lost: CancellationToken,
  task: Option<JoinHandle<()>>,
}

impl RenewalTimer {
  pub fn start<S, F, Fut>(
    parent: &CancellationToken,
    initial_delay: Duration,
    mut strategy: S,
    mut renew: F,
  ) -> Self
  where
    S: DelayStrategy,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = RenewOutcome> + Send + 'static,
  {
    let stop = parent.child_token();
    let lost = CancellationToken::new();

    let task_stop = stop.clone();
    let task_lost = lost.clone();
    let task = tokio::spawn(async move {
      let mut delay = initial_delay;
      loop {
        tokio::select! {
          biased;
          _ = task_stop.cancelled() => break,
          _ = tokio::time::sleep(delay) => {}
        }

        let outcome = renew().await;
        match outcome {
          RenewOutcome::Renewed => delay = strategy.next_delay(true),
          RenewOutcome::Retry => delay = strategy.next_delay(false),
          RenewOutcome::Lost => {
            task_lost.cancel();
            break;
          }
        }
      }
    });

    Self {
      stop,
      lost,
      task: Some(task),
    }
  }

  /// Fires if a renewal reported the resource as lost.
  pub fn lost(&self) -> CancellationToken {
    self.lost.clone()
  }

  pub fn is_lost(&self) -> bool {
    self.lost.is_cancelled()
  }

  /// Stop renewing and wait for the task to exit.
  pub async fn stop(mut self) {
    self.stop.cancel();
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
  }
}

impl Drop for RenewalTimer {
  fn drop(&mut self) {
    self.stop.cancel();
  }
}
