//! Queue polling with visibility renewal and poison-message handling.

use std::sync::Arc;
use std::time::Duration;

use canopy_config::QueueConfig;
use canopy_dispatch::{DispatchError, InvocationDispatcher};
use canopy_lease::{LinearSpeedupStrategy, RenewOutcome, RenewalTimer};
use canopy_storage::{QueueMessage, QueueRef, QueueStore, StorageError};
use canopy_trigger::FunctionDescriptor;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;

#[derive(Debug, Clone)]
pub struct QueueSettings {
  pub visibility_timeout: Duration,
  pub min_renewal_interval: Duration,
  pub max_renewal_interval: Duration,
  pub min_polling_interval: Duration,
  pub max_polling_interval: Duration,
  /// Failed messages at or past this delivery count go to the poison queue.
  pub max_dequeue_count: u32,
}

impl Default for QueueSettings {
  fn default() -> Self {
    Self::from(&QueueConfig::default())
  }
}

impl From<&QueueConfig> for QueueSettings {
  fn from(config: &QueueConfig) -> Self {
    Self {
      visibility_timeout: config.visibility_timeout(),
      min_renewal_interval: config.min_renewal_interval(),
      max_renewal_interval: config.max_renewal_interval(),
      min_polling_interval: config.min_polling_interval(),
      max_polling_interval: config.max_polling_interval(),
      max_dequeue_count: config.max_dequeue_count.max(1),
    }
  }
}

impl QueueSettings {
  /// Half the visibility timeout, kept within the renewal bounds.
  pub fn renewal_interval(&self) -> Duration {
    (self.visibility_timeout / 2)
      .min(self.max_renewal_interval)
      .max(self.min_renewal_interval)
  }
}

/// Lifecycle of a dequeued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
  Idle,
  Dequeued,
  Dispatching,
  /// Every function succeeded and the message was deleted.
  Deleted,
  /// The message was left in the queue and reappears once its visibility
  /// timeout lapses.
  RedeliveryPending,
  /// A function failed on the last allowed delivery. The message was copied
  /// to the poison queue and deleted from this one.
  Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
  QueueMissing,
  Empty,
  Processed {
    message_id: String,
    state: MessageState,
  },
}

/// Polls one queue and runs every function bound to it for each message.
///
/// While functions run, a renewal task keeps the message invisible. The
/// message is deleted only when all functions complete successfully; on any
/// failure, cancellation or lost visibility it is left for redelivery. A
/// function failure on a message already delivered `max_dequeue_count` times
/// moves it to [`poison_queue_name`] instead.
pub struct QueueLeasePoller {
  queue: QueueRef,
  store: Arc<dyn QueueStore>,
  functions: Vec<FunctionDescriptor>,
  dispatcher: InvocationDispatcher,
  settings: QueueSettings,
}

impl QueueLeasePoller {
  pub fn new(
    queue: QueueRef,
    store: Arc<dyn QueueStore>,
    functions: Vec<FunctionDescriptor>,
    dispatcher: InvocationDispatcher,
    settings: QueueSettings,
  ) -> Self {
    Self {
      queue,
      store,
      functions,
      dispatcher,
      settings,
    }
  }

  pub fn queue(&self) -> &QueueRef {
    &self.queue
  }

  /// Poll until `cancel` fires, backing off while the queue is empty.
  pub async fn run(&self, cancel: CancellationToken) {
    info!(queue = %self.queue, functions = self.functions.len(), "queue poller started");
    let mut backoff = Backoff::new(
      self.settings.min_polling_interval,
      self.settings.max_polling_interval,
    );

    while !cancel.is_cancelled() {
      let delay = match self.poll_once(&cancel).await {
        Ok(PollOutcome::Processed { .. }) => {
          backoff.reset();
          Duration::ZERO
        }
        Ok(PollOutcome::Empty | PollOutcome::QueueMissing) => backoff.next_delay(),
        Err(e) => {
          if e.is_transient() {
            warn!(queue = %self.queue, error = %e, "queue poll failed");
          } else {
            error!(queue = %self.queue, error = %e, "queue poll failed");
          }
          backoff.next_delay()
        }
      };

      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(delay) => {}
      }
    }

    info!(queue = %self.queue, "queue poller stopped");
  }

  /// Dequeue and fully process at most one message.
  #[instrument(name = "queue.poll", skip(self, cancel), fields(queue = %self.queue))]
  pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<PollOutcome, StorageError> {
    if !self.store.exists(self.queue.name()).await? {
      return Ok(PollOutcome::QueueMissing);
    }

    let message = match self
      .store
      .dequeue(self.queue.name(), self.settings.visibility_timeout)
      .await
    {
      Ok(Some(message)) => message,
      Ok(None) => return Ok(PollOutcome::Empty),
      Err(e) if e.is_not_found() => return Ok(PollOutcome::QueueMissing),
      Err(e) => return Err(e),
    };

    let message_id = message.id.clone();
    let state = self.process(message, cancel).await;
    Ok(PollOutcome::Processed { message_id, state })
  }

  async fn process(&self, message: QueueMessage, cancel: &CancellationToken) -> MessageState {
    let mut state = MessageState::Dequeued;
    debug!(message_id = %message.id, dequeue_count = message.dequeue_count, state = ?state, "message dequeued");

    // Every visibility update issues a new pop receipt; delete needs the latest.
    let receipt = Arc::new(Mutex::new(message.pop_receipt.clone()));
    let timer = self.start_renewal(&message.id, receipt.clone(), cancel);
    let lost = timer.lost();

    state = MessageState::Dispatching;
    let mut completed = true;
    let mut failed = false;
    for function in &self.functions {
      if cancel.is_cancelled() {
        info!(message_id = %message.id, "cancelled, remaining functions skipped");
        completed = false;
        break;
      }
      if lost.is_cancelled() {
        warn!(message_id = %message.id, "message visibility lost, remaining functions skipped");
        completed = false;
        break;
      }

      if let Err(e) = self
        .dispatcher
        .invoke_queue_message(function, &self.queue, &message, cancel)
        .await
      {
        failed = !matches!(e, DispatchError::Cancelled);
        warn!(
          message_id = %message.id,
          function = %function.name,
          error = %e,
          "function did not complete, remaining functions skipped"
        );
        completed = false;
        break;
      }
    }

    timer.stop().await;
    debug!(message_id = %message.id, state = ?state, "dispatch finished");

    if lost.is_cancelled() {
      return MessageState::RedeliveryPending;
    }
    let pop_receipt = receipt.lock().await.clone();
    if failed && message.dequeue_count >= self.settings.max_dequeue_count {
      return self.move_to_poison(&message, &pop_receipt).await;
    }
    if !completed {
      return MessageState::RedeliveryPending;
    }

    self.delete(&message, &pop_receipt).await
  }

  async fn move_to_poison(&self, message: &QueueMessage, pop_receipt: &str) -> MessageState {
    let poison = poison_queue_name(self.queue.name());
    warn!(
      message_id = %message.id,
      dequeue_count = message.dequeue_count,
      poison_queue = %poison,
      "message reached the maximum dequeue count, moving it to the poison queue"
    );

    let copied = match self.store.create_if_not_exists(&poison).await {
      Ok(_) => self.store.enqueue(&poison, message.body.clone()).await,
      Err(e) => Err(e),
    };
    if let Err(e) = copied {
      error!(message_id = %message.id, poison_queue = %poison, error = %e, "failed to copy message to the poison queue");
      return MessageState::RedeliveryPending;
    }

    match self.delete(message, pop_receipt).await {
      MessageState::Deleted => MessageState::Poisoned,
      state => state,
    }
  }

  async fn delete(&self, message: &QueueMessage, pop_receipt: &str) -> MessageState {
    match self
      .store
      .delete(self.queue.name(), &message.id, pop_receipt)
      .await
    {
      Ok(()) => {
        debug!(message_id = %message.id, "message deleted");
        MessageState::Deleted
      }
      Err(e) if e.is_not_found() => {
        warn!(message_id = %message.id, "message was gone before it could be deleted");
        MessageState::RedeliveryPending
      }
      Err(e) => {
        warn!(message_id = %message.id, error = %e, "failed to delete message");
        MessageState::RedeliveryPending
      }
    }
  }

  fn start_renewal(
    &self,
    message_id: &str,
    receipt: Arc<Mutex<String>>,
    cancel: &CancellationToken,
  ) -> RenewalTimer {
    let interval = self.settings.renewal_interval();
    let strategy = LinearSpeedupStrategy::new(interval, self.settings.min_renewal_interval);
    let store = self.store.clone();
    let queue = self.queue.name().to_string();
    let message_id = message_id.to_string();
    let visibility = self.settings.visibility_timeout;

    RenewalTimer::start(cancel, interval, strategy, move || {
      let store = store.clone();
      let queue = queue.clone();
      let message_id = message_id.clone();
      let receipt = receipt.clone();
      async move {
        let mut current = receipt.lock().await;
        match store
          .update_visibility(&queue, &message_id, &current, visibility)
          .await
        {
          Ok(next) => {
            *current = next;
            debug!(queue = %queue, message_id = %message_id, "message visibility extended");
            RenewOutcome::Renewed
          }
          Err(e) if e.is_transient() => {
            warn!(queue = %queue, message_id = %message_id, error = %e, "failed to extend message visibility, retrying");
            RenewOutcome::Retry
          }
          Err(e) => {
            error!(queue = %queue, message_id = %message_id, error = %e, "message visibility lost");
            RenewOutcome::Lost
          }
        }
      }
    })
  }
}

/// Name of the queue that receives messages from `queue` which kept failing.
pub fn poison_queue_name(queue: &str) -> String {
  format!("{queue}-poison")
}
