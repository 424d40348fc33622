use async_trait::async_trait;
use canopy_storage::BlobPath;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::request::InvocationRequest;

/// A blob written by an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBlob {
  pub account: String,
  pub path: BlobPath,
}

/// What an executor reports back after a successful run.
#[derive(Debug, Clone, Default)]
pub struct InvocationOutcome {
  /// Blobs the function wrote. They are stamped with the invocation's
  /// instance id.
  pub written_blobs: Vec<WrittenBlob>,
}

/// Runs function code for an invocation request.
///
/// Implementations should stop promptly when `cancel` fires and report
/// [`ExecutorError::Cancelled`].
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
  async fn execute(
    &self,
    request: InvocationRequest,
    cancel: CancellationToken,
  ) -> Result<InvocationOutcome, ExecutorError>;
}

/// Executor that forwards requests into a channel for an external runner.
///
/// An invocation succeeds as soon as the request is queued.
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
  sender: mpsc::UnboundedSender<InvocationRequest>,
}

impl ChannelExecutor {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<InvocationRequest>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self { sender }, receiver)
  }
}

#[async_trait]
impl FunctionExecutor for ChannelExecutor {
  async fn execute(
    &self,
    request: InvocationRequest,
    _cancel: CancellationToken,
  ) -> Result<InvocationOutcome, ExecutorError> {
    self
      .sender
      .send(request)
      .map_err(|_| ExecutorError::Unavailable("request channel closed".to_string()))?;
    Ok(InvocationOutcome::default())
  }
}
