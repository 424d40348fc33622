use std::time::Duration;

use canopy_dispatch::InvocationDispatcher;
use canopy_trigger::FunctionDescriptor;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Dispatches a function on a fixed interval. The first run happens one
/// interval after start.
pub struct TimerListener {
  function: FunctionDescriptor,
  interval: Duration,
  dispatcher: InvocationDispatcher,
}

impl TimerListener {
  pub fn new(function: FunctionDescriptor, interval: Duration, dispatcher: InvocationDispatcher) -> Self {
    Self {
      function,
      interval,
      dispatcher,
    }
  }

  pub fn function(&self) -> &FunctionDescriptor {
    &self.function
  }

  pub async fn run(&self, cancel: CancellationToken) {
    info!(function = %self.function.name, interval_ms = self.interval.as_millis() as u64, "timer started");
    let mut ticks = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticks.tick() => {
          self
            .dispatcher
            .dispatch_timer(&self.function, self.interval.as_millis() as u64, &cancel);
        }
      }
    }
  }
}
