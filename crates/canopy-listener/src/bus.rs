use std::sync::Arc;
use std::time::Duration;

use canopy_dispatch::InvocationDispatcher;
use canopy_storage::{EntityRef, MessageBus, StorageError};
use canopy_trigger::FunctionDescriptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::queue::{MessageState, PollOutcome, QueueSettings};

/// Receives messages from a bus entity under a peek-lock. A message is
/// completed when every function succeeds and abandoned otherwise.
pub struct BusPoller {
  entity: EntityRef,
  bus: Arc<dyn MessageBus>,
  functions: Vec<FunctionDescriptor>,
  dispatcher: InvocationDispatcher,
  lock_duration: Duration,
  min_polling_interval: Duration,
  max_polling_interval: Duration,
}

impl BusPoller {
  /// Lock duration and polling bounds come from the queue settings.
  pub fn new(
    entity: EntityRef,
    bus: Arc<dyn MessageBus>,
    functions: Vec<FunctionDescriptor>,
    dispatcher: InvocationDispatcher,
    settings: &QueueSettings,
  ) -> Self {
    Self {
      entity,
      bus,
      functions,
      dispatcher,
      lock_duration: settings.visibility_timeout,
      min_polling_interval: settings.min_polling_interval,
      max_polling_interval: settings.max_polling_interval,
    }
  }

  pub fn entity(&self) -> &EntityRef {
    &self.entity
  }

  pub async fn run(&self, cancel: CancellationToken) {
    info!(entity = %self.entity, "bus poller started");
    let mut backoff = Backoff::new(self.min_polling_interval, self.max_polling_interval);

    while !cancel.is_cancelled() {
      let delay = match self.poll_once(&cancel).await {
        Ok(PollOutcome::Processed { .. }) => {
          backoff.reset();
          Duration::ZERO
        }
        Ok(_) => backoff.next_delay(),
        Err(e) => {
          error!(entity = %self.entity, error = %e, "bus receive failed");
          backoff.next_delay()
        }
      };

      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(delay) => {}
      }
    }

    info!(entity = %self.entity, "bus poller stopped");
  }

  pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<PollOutcome, StorageError> {
    let Some(received) = self
      .bus
      .receive(self.entity.path(), self.lock_duration)
      .await?
    else {
      return Ok(PollOutcome::Empty);
    };

    let mut completed = true;
    for function in &self.functions {
      if cancel.is_cancelled() {
        completed = false;
        break;
      }
      if let Err(e) = self
        .dispatcher
        .invoke_bus_message(function, &self.entity, &received, cancel)
        .await
      {
        warn!(function = %function.name, error = %e, "function did not complete, abandoning message");
        completed = false;
        break;
      }
    }

    let settled = if completed {
      self
        .bus
        .complete(self.entity.path(), &received.lock_token)
        .await
    } else {
      self
        .bus
        .abandon(self.entity.path(), &received.lock_token)
        .await
    };

    let state = match settled {
      Ok(()) if completed => MessageState::Deleted,
      Ok(()) => MessageState::RedeliveryPending,
      Err(e) => {
        warn!(entity = %self.entity, error = %e, "failed to settle message, lock will expire");
        MessageState::RedeliveryPending
      }
    };
    debug!(entity = %self.entity, state = ?state, "bus message settled");

    Ok(PollOutcome::Processed {
      message_id: received.lock_token,
      state,
    })
  }
}
