//! Runs invocations against a [`FunctionExecutor`](crate::FunctionExecutor),
//! holding the function's singleton lock when it has one and recording the
//! blobs it wrote.

use std::sync::Arc;

use canopy_causality::{CausalityTracker, Resource};
use canopy_lease::{LeaseError, SingletonLock, SingletonManager};
use canopy_storage::{BlobPath, EntityRef, QueueMessage, QueueRef, ReceivedMessage};
use canopy_trigger::{Captures, FunctionDescriptor};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{DispatchError, ExecutorError};
use crate::executor::{FunctionExecutor, InvocationOutcome};
use crate::hint::BlobHintSender;
use crate::request::{InvocationRequest, TriggerReason};

#[derive(Debug, Clone)]
pub struct InvocationResult {
  pub instance_id: Uuid,
  pub outcome: InvocationOutcome,
}

/// Builds invocation requests and runs them through the executor.
#[derive(Clone)]
pub struct InvocationDispatcher {
  executor: Arc<dyn FunctionExecutor>,
  causality: CausalityTracker,
  singletons: Option<SingletonManager>,
  blob_hints: Option<BlobHintSender>,
  tasks: TaskTracker,
}

impl InvocationDispatcher {
  pub fn new(executor: Arc<dyn FunctionExecutor>, causality: CausalityTracker) -> Self {
    Self {
      executor,
      causality,
      singletons: None,
      blob_hints: None,
      tasks: TaskTracker::new(),
    }
  }

  /// Guard singleton functions with locks from `singletons`.
  pub fn with_singletons(mut self, singletons: SingletonManager) -> Self {
    self.singletons = Some(singletons);
    self
  }

  /// Push written blobs to the blob listener as soon as an invocation completes.
  pub fn with_blob_hints(mut self, hints: BlobHintSender) -> Self {
    self.blob_hints = Some(hints);
    self
  }

  pub fn causality(&self) -> &CausalityTracker {
    &self.causality
  }

  /// Start a blob-triggered invocation without waiting for it.
  pub async fn dispatch_blob(
    &self,
    function: &FunctionDescriptor,
    account: &str,
    path: &BlobPath,
    captures: Captures,
    cancel: &CancellationToken,
  ) -> Uuid {
    let parent_id = self.causality.owner(Resource::Blob { account, path }).await;
    let reason = TriggerReason::Blob {
      account: account.to_string(),
      path: path.clone(),
      captures,
    };
    self.dispatch(InvocationRequest::new(function.clone(), reason, parent_id), cancel)
  }

  /// Run a queue-triggered invocation and wait for it.
  pub async fn invoke_queue_message(
    &self,
    function: &FunctionDescriptor,
    queue: &QueueRef,
    message: &QueueMessage,
    cancel: &CancellationToken,
  ) -> Result<InvocationResult, DispatchError> {
    let parent_id = self.causality.owner(Resource::QueueMessage(message)).await;
    let reason = TriggerReason::Queue {
      account: queue.account().to_string(),
      queue: queue.name().to_string(),
      message_id: message.id.clone(),
      dequeue_count: message.dequeue_count,
      body: message.body.clone(),
    };
    self
      .invoke(InvocationRequest::new(function.clone(), reason, parent_id), cancel)
      .await
  }

  /// Run a bus-triggered invocation and wait for it.
  pub async fn invoke_bus_message(
    &self,
    function: &FunctionDescriptor,
    entity: &EntityRef,
    received: &ReceivedMessage,
    cancel: &CancellationToken,
  ) -> Result<InvocationResult, DispatchError> {
    let parent_id = self
      .causality
      .owner(Resource::BusMessage(&received.message))
      .await;
    let reason = TriggerReason::Bus {
      account: entity.account().to_string(),
      entity: entity.path().to_string(),
      delivery_count: received.delivery_count,
      body: received.message.body.clone(),
      properties: received.message.properties.clone(),
    };
    self
      .invoke(InvocationRequest::new(function.clone(), reason, parent_id), cancel)
      .await
  }

  pub fn dispatch_timer(
    &self,
    function: &FunctionDescriptor,
    interval_ms: u64,
    cancel: &CancellationToken,
  ) -> Uuid {
    let reason = TriggerReason::Timer { interval_ms };
    self.dispatch(InvocationRequest::new(function.clone(), reason, None), cancel)
  }

  /// Invoke a function on request rather than from a trigger.
  pub fn dispatch_manual(
    &self,
    function: &FunctionDescriptor,
    parent_id: Option<Uuid>,
    cancel: &CancellationToken,
  ) -> Uuid {
    let request = InvocationRequest::new(function.clone(), TriggerReason::Manual, parent_id);
    self.dispatch(request, cancel)
  }

  /// Start an invocation in the background and return its instance id.
  /// Failures are logged.
  pub fn dispatch(&self, request: InvocationRequest, cancel: &CancellationToken) -> Uuid {
    let instance_id = request.instance_id;
    let dispatcher = self.clone();
    let cancel = cancel.clone();
    self.tasks.spawn(async move {
      // Errors are logged by invoke
      let _ = dispatcher.invoke(request, &cancel).await;
    });
    instance_id
  }

  /// Run an invocation to completion.
  #[instrument(
    name = "dispatch.invoke",
    skip(self, request, cancel),
    fields(function = %request.function.name, instance_id = %request.instance_id)
  )]
  pub async fn invoke(
    &self,
    request: InvocationRequest,
    cancel: &CancellationToken,
  ) -> Result<InvocationResult, DispatchError> {
    let instance_id = request.instance_id;
    let function = request.function.name.clone();

    let lock = match self.acquire_singleton(&request, cancel).await {
      Ok(lock) => lock,
      Err(LeaseError::Cancelled) => return Err(DispatchError::Cancelled),
      Err(e) => {
        error!(error = %e, "failed to acquire singleton lock");
        return Err(e.into());
      }
    };
    let lost = lock
      .as_ref()
      .map(SingletonLock::lost)
      .unwrap_or_default();

    info!(reason = %request.reason.description(), "executing function");
    let started = Instant::now();
    let exec_cancel = cancel.child_token();
    let result = tokio::select! {
      result = self.executor.execute(request, exec_cancel.clone()) => result.map_err(Some),
      _ = lost.cancelled() => {
        exec_cancel.cancel();
        Err(None)
      }
    };

    if let Some(lock) = lock
      && let Err(e) = lock.release().await
    {
      warn!(error = %e, "failed to release singleton lock");
    }

    match result {
      Ok(outcome) => {
        info!(
          duration_ms = started.elapsed().as_millis() as u64,
          written_blobs = outcome.written_blobs.len(),
          "function completed"
        );
        self.record_outputs(instance_id, &outcome).await;
        Ok(InvocationResult {
          instance_id,
          outcome,
        })
      }
      Err(None) => {
        error!("singleton lock lost, invocation aborted");
        Err(DispatchError::LockLost {
          instance_id,
          function,
        })
      }
      Err(Some(ExecutorError::Cancelled)) => {
        info!("function cancelled");
        Err(DispatchError::Cancelled)
      }
      Err(Some(e)) => {
        error!(error = %e, "function failed");
        Err(DispatchError::Failed {
          instance_id,
          function,
          source: e,
        })
      }
    }
  }

  async fn acquire_singleton(
    &self,
    request: &InvocationRequest,
    cancel: &CancellationToken,
  ) -> Result<Option<SingletonLock>, LeaseError> {
    let Some(singleton) = &request.function.singleton else {
      return Ok(None);
    };
    let Some(singletons) = &self.singletons else {
      warn!("singleton function dispatched without a lock manager, running unguarded");
      return Ok(None);
    };

    let lock_id = singletons.function_lock_id(&request.function.name, singleton.scope.as_deref());
    let owner = request.instance_id.to_string();
    let lock = singletons
      .lock(&lock_id, Some(owner.as_str()), singletons.settings().lock_period, cancel)
      .await?;
    Ok(Some(lock))
  }

  async fn record_outputs(&self, instance_id: Uuid, outcome: &InvocationOutcome) {
    for written in &outcome.written_blobs {
      self
        .causality
        .stamp_blob(&written.account, &written.path, instance_id)
        .await;
      if let Some(hints) = &self.blob_hints {
        hints.send(written.account.clone(), written.path.clone());
      }
    }
  }

  /// Stop accepting background invocations and wait for running ones.
  pub async fn shutdown(&self) {
    self.tasks.close();
    self.tasks.wait().await;
  }

  /// Number of background invocations still running.
  pub fn in_flight(&self) -> usize {
    self.tasks.len()
  }
}
