//! Queue polling with visibility renewal, driven by a paused tokio clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use canopy_causality::CausalityTracker;
use canopy_dispatch::{
  ExecutorError, FunctionExecutor, InvocationDispatcher, InvocationOutcome, InvocationRequest,
};
use canopy_listener::{
  MessageState, PollOutcome, QueueLeasePoller, QueueSettings, poison_queue_name,
};
use canopy_storage::{
  MemoryQueueStore, QueueMessage, QueueRef, QueueStore, StorageAccount, StorageAccounts,
  StorageError,
};
use canopy_trigger::FunctionDescriptor;
use tokio_util::sync::CancellationToken;

/// Records which functions ran. Sleeps for `delay` per call, fails the
/// function named in `fail`, and cancels `cancel_after.1` once
/// `cancel_after.0` calls have been made.
#[derive(Default)]
struct ScriptedExecutor {
  calls: Mutex<Vec<String>>,
  delay: Option<Duration>,
  fail: Option<String>,
  cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedExecutor {
  fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl FunctionExecutor for ScriptedExecutor {
  async fn execute(
    &self,
    request: InvocationRequest,
    cancel: CancellationToken,
  ) -> Result<InvocationOutcome, ExecutorError> {
    let count = {
      let mut calls = self.calls.lock().unwrap();
      calls.push(request.function.name.clone());
      calls.len()
    };

    if let Some(delay) = self.delay {
      tokio::select! {
        _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
        _ = tokio::time::sleep(delay) => {}
      }
    }
    if let Some((after, token)) = &self.cancel_after
      && count >= *after
    {
      token.cancel();
    }
    if self.fail.as_deref() == Some(request.function.name.as_str()) {
      return Err(ExecutorError::Failed("boom".to_string()));
    }
    Ok(InvocationOutcome::default())
  }
}

/// Counts visibility updates and can reject them as if the message were gone.
/// With `slow_replies` set, an update is applied at once but its reply takes
/// two seconds to arrive.
struct CountingQueue {
  inner: MemoryQueueStore,
  renewals: AtomicUsize,
  reject_renewals: AtomicBool,
  slow_replies: AtomicBool,
}

impl CountingQueue {
  fn new(inner: MemoryQueueStore) -> Self {
    Self {
      inner,
      renewals: AtomicUsize::new(0),
      reject_renewals: AtomicBool::new(false),
      slow_replies: AtomicBool::new(false),
    }
  }
}

#[async_trait]
impl QueueStore for CountingQueue {
  async fn exists(&self, queue: &str) -> Result<bool, StorageError> {
    self.inner.exists(queue).await
  }

  async fn create_if_not_exists(&self, queue: &str) -> Result<bool, StorageError> {
    self.inner.create_if_not_exists(queue).await
  }

  async fn enqueue(&self, queue: &str, body: String) -> Result<String, StorageError> {
    self.inner.enqueue(queue, body).await
  }

  async fn dequeue(
    &self,
    queue: &str,
    visibility: Duration,
  ) -> Result<Option<QueueMessage>, StorageError> {
    self.inner.dequeue(queue, visibility).await
  }

  async fn update_visibility(
    &self,
    queue: &str,
    message_id: &str,
    pop_receipt: &str,
    visibility: Duration,
  ) -> Result<String, StorageError> {
    self.renewals.fetch_add(1, Ordering::SeqCst);
    if self.reject_renewals.load(Ordering::SeqCst) {
      return Err(StorageError::NotFound(format!("message {message_id}")));
    }
    let receipt = self
      .inner
      .update_visibility(queue, message_id, pop_receipt, visibility)
      .await?;
    if self.slow_replies.load(Ordering::SeqCst) {
      tokio::time::sleep(Duration::from_secs(2)).await;
    }
    Ok(receipt)
  }

  async fn delete(
    &self,
    queue: &str,
    message_id: &str,
    pop_receipt: &str,
  ) -> Result<(), StorageError> {
    self.inner.delete(queue, message_id, pop_receipt).await
  }
}

struct Fixture {
  memory: MemoryQueueStore,
  store: Arc<CountingQueue>,
  queue: QueueRef,
}

async fn fixture() -> Fixture {
  let memory = MemoryQueueStore::new();
  memory.create_if_not_exists("orders").await.unwrap();
  memory
    .enqueue("orders", r#"{"order":1}"#.to_string())
    .await
    .unwrap();
  Fixture {
    store: Arc::new(CountingQueue::new(memory.clone())),
    memory,
    queue: QueueRef::new("main", "orders"),
  }
}

fn dispatcher(f: &Fixture, executor: Arc<ScriptedExecutor>) -> InvocationDispatcher {
  let accounts = StorageAccounts::new(StorageAccount::new("main").with_queues(f.store.clone()));
  InvocationDispatcher::new(executor, CausalityTracker::new(accounts))
}

fn poller(
  f: &Fixture,
  executor: Arc<ScriptedExecutor>,
  functions: &[&str],
  settings: QueueSettings,
) -> QueueLeasePoller {
  QueueLeasePoller::new(
    f.queue.clone(),
    f.store.clone(),
    functions.iter().map(|name| FunctionDescriptor::new(*name)).collect(),
    dispatcher(f, executor),
    settings,
  )
}

fn short_visibility() -> QueueSettings {
  QueueSettings {
    visibility_timeout: Duration::from_secs(60),
    min_renewal_interval: Duration::from_secs(10),
    ..QueueSettings::default()
  }
}

fn state(outcome: PollOutcome) -> MessageState {
  match outcome {
    PollOutcome::Processed { state, .. } => state,
    other => panic!("expected a processed message, got {other:?}"),
  }
}

#[tokio::test(start_paused = true)]
async fn long_invocation_keeps_message_hidden_until_deleted() {
  let f = fixture().await;
  let executor = Arc::new(ScriptedExecutor {
    delay: Some(Duration::from_secs(12 * 60)),
    ..Default::default()
  });
  let poller = poller(&f, executor.clone(), &["Orders.Process"], QueueSettings::default());

  let competing_dequeue = tokio::spawn({
    let memory = f.memory.clone();
    async move {
      tokio::time::sleep(Duration::from_secs(11 * 60)).await;
      memory
        .dequeue("orders", Duration::from_secs(30))
        .await
        .unwrap()
    }
  });

  let outcome = poller.poll_once(&CancellationToken::new()).await.unwrap();

  assert_eq!(state(outcome), MessageState::Deleted);
  assert!(competing_dequeue.await.unwrap().is_none(), "message was redelivered mid-invocation");
  // Renewed at 5 and 10 minutes.
  assert_eq!(f.store.renewals.load(Ordering::SeqCst), 2);
  assert_eq!(f.memory.len("orders").await, 0);
  assert_eq!(executor.calls(), vec!["Orders.Process"]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_between_functions_leaves_message_for_redelivery() {
  let f = fixture().await;
  let cancel = CancellationToken::new();
  let executor = Arc::new(ScriptedExecutor {
    cancel_after: Some((2, cancel.clone())),
    ..Default::default()
  });
  let poller = poller(&f, executor.clone(), &["A", "B", "C"], short_visibility());

  let outcome = poller.poll_once(&cancel).await.unwrap();

  assert_eq!(state(outcome), MessageState::RedeliveryPending);
  assert_eq!(executor.calls(), vec!["A", "B"]);
  assert_eq!(f.memory.len("orders").await, 1);

  let hidden = f.memory.dequeue("orders", Duration::from_secs(60)).await.unwrap();
  assert!(hidden.is_none());

  tokio::time::sleep(Duration::from_secs(61)).await;
  let redelivered = f
    .memory
    .dequeue("orders", Duration::from_secs(60))
    .await
    .unwrap()
    .expect("message visible again");
  assert_eq!(redelivered.dequeue_count, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_function_stops_the_rest_and_keeps_message() {
  let f = fixture().await;
  let executor = Arc::new(ScriptedExecutor {
    fail: Some("B".to_string()),
    ..Default::default()
  });
  let poller = poller(&f, executor.clone(), &["A", "B", "C"], short_visibility());

  let outcome = poller.poll_once(&CancellationToken::new()).await.unwrap();

  assert_eq!(state(outcome), MessageState::RedeliveryPending);
  assert_eq!(executor.calls(), vec!["A", "B"]);
  assert_eq!(f.memory.len("orders").await, 1);
}

#[tokio::test(start_paused = true)]
async fn all_functions_run_in_order_before_delete() {
  let f = fixture().await;
  let executor = Arc::new(ScriptedExecutor::default());
  let poller = poller(&f, executor.clone(), &["A", "B", "C"], short_visibility());

  let outcome = poller.poll_once(&CancellationToken::new()).await.unwrap();

  assert_eq!(state(outcome), MessageState::Deleted);
  assert_eq!(executor.calls(), vec!["A", "B", "C"]);
  assert_eq!(f.memory.len("orders").await, 0);
}

#[tokio::test(start_paused = true)]
async fn delete_uses_receipt_from_renewal_finishing_after_the_functions() {
  let f = fixture().await;
  f.store.slow_replies.store(true, Ordering::SeqCst);
  // Renewal starts at 30s and replies at 32s; the function ends at 31s.
  let executor = Arc::new(ScriptedExecutor {
    delay: Some(Duration::from_secs(31)),
    ..Default::default()
  });
  let poller = poller(&f, executor.clone(), &["A"], short_visibility());

  let outcome = poller.poll_once(&CancellationToken::new()).await.unwrap();

  assert_eq!(state(outcome), MessageState::Deleted);
  assert_eq!(f.store.renewals.load(Ordering::SeqCst), 1);
  assert_eq!(f.memory.len("orders").await, 0);
}

#[tokio::test(start_paused = true)]
async fn failure_on_last_allowed_delivery_moves_message_to_poison_queue() {
  let f = fixture().await;
  let executor = Arc::new(ScriptedExecutor {
    fail: Some("A".to_string()),
    ..Default::default()
  });
  let settings = QueueSettings {
    max_dequeue_count: 2,
    ..short_visibility()
  };
  let poller = poller(&f, executor.clone(), &["A"], settings);
  let cancel = CancellationToken::new();

  // First delivery is below the limit.
  let outcome = poller.poll_once(&cancel).await.unwrap();
  assert_eq!(state(outcome), MessageState::RedeliveryPending);
  assert!(!f.memory.exists(&poison_queue_name("orders")).await.unwrap());

  tokio::time::sleep(Duration::from_secs(61)).await;
  let outcome = poller.poll_once(&cancel).await.unwrap();
  assert_eq!(state(outcome), MessageState::Poisoned);
  assert_eq!(f.memory.len("orders").await, 0);
  assert_eq!(f.memory.len("orders-poison").await, 1);

  let poisoned = f
    .memory
    .dequeue("orders-poison", Duration::from_secs(60))
    .await
    .unwrap()
    .expect("message in poison queue");
  assert_eq!(poisoned.body, r#"{"order":1}"#);
  assert_eq!(executor.calls(), vec!["A", "A"]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_never_poisons_a_message() {
  let f = fixture().await;
  let cancel = CancellationToken::new();
  let executor = Arc::new(ScriptedExecutor {
    delay: Some(Duration::from_secs(5)),
    ..Default::default()
  });
  let settings = QueueSettings {
    max_dequeue_count: 1,
    ..short_visibility()
  };
  let poller = poller(&f, executor.clone(), &["A"], settings);

  let stopper = tokio::spawn({
    let cancel = cancel.clone();
    async move {
      tokio::time::sleep(Duration::from_secs(1)).await;
      cancel.cancel();
    }
  });
  let outcome = poller.poll_once(&cancel).await.unwrap();
  stopper.await.unwrap();

  assert_eq!(state(outcome), MessageState::RedeliveryPending);
  assert_eq!(f.memory.len("orders").await, 1);
  assert!(!f.memory.exists("orders-poison").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn lost_visibility_skips_remaining_functions() {
  let f = fixture().await;
  f.store.reject_renewals.store(true, Ordering::SeqCst);
  let executor = Arc::new(ScriptedExecutor {
    delay: Some(Duration::from_secs(45)),
    ..Default::default()
  });
  let poller = poller(&f, executor.clone(), &["A", "B"], short_visibility());

  let outcome = poller.poll_once(&CancellationToken::new()).await.unwrap();

  assert_eq!(state(outcome), MessageState::RedeliveryPending);
  assert_eq!(executor.calls(), vec!["A"]);
  assert_eq!(f.store.renewals.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_and_empty_queues_are_not_errors() {
  let f = fixture().await;
  let executor = Arc::new(ScriptedExecutor::default());
  let cancel = CancellationToken::new();

  let missing = QueueLeasePoller::new(
    QueueRef::new("main", "absent"),
    f.store.clone(),
    vec![FunctionDescriptor::new("A")],
    dispatcher(&f, executor.clone()),
    short_visibility(),
  );
  assert_eq!(missing.poll_once(&cancel).await.unwrap(), PollOutcome::QueueMissing);

  let poller = poller(&f, executor.clone(), &["A"], short_visibility());
  assert!(matches!(
    poller.poll_once(&cancel).await.unwrap(),
    PollOutcome::Processed { .. }
  ));
  assert_eq!(poller.poll_once(&cancel).await.unwrap(), PollOutcome::Empty);
  assert_eq!(executor.calls(), vec!["A"]);
}

#[tokio::test(start_paused = true)]
async fn run_loop_backs_off_and_picks_up_new_messages() {
  let f = fixture().await;
  let executor = Arc::new(ScriptedExecutor::default());
  let poller = Arc::new(poller(&f, executor.clone(), &["A"], short_visibility()));
  let cancel = CancellationToken::new();

  let task = tokio::spawn({
    let poller = poller.clone();
    let cancel = cancel.clone();
    async move { poller.run(cancel).await }
  });

  tokio::time::sleep(Duration::from_secs(5)).await;
  assert_eq!(executor.calls().len(), 1);

  f.memory
    .enqueue("orders", r#"{"order":2}"#.to_string())
    .await
    .unwrap();
  tokio::time::sleep(Duration::from_secs(61)).await;
  assert_eq!(executor.calls().len(), 2);
  assert_eq!(f.memory.len("orders").await, 0);

  cancel.cancel();
  task.await.unwrap();
}
