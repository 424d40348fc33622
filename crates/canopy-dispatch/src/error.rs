use canopy_lease::LeaseError;
use uuid::Uuid;

/// Errors reported by a function executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
  #[error("function failed: {0}")]
  Failed(String),

  #[error("execution cancelled")]
  Cancelled,

  #[error("executor unavailable: {0}")]
  Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
  #[error("invocation {instance_id} of '{function}' failed: {source}")]
  Failed {
    instance_id: Uuid,
    function: String,
    #[source]
    source: ExecutorError,
  },

  #[error("invocation cancelled")]
  Cancelled,

  #[error("singleton lock for '{function}' was lost during invocation {instance_id}")]
  LockLost { instance_id: Uuid, function: String },

  #[error("lock error: {0}")]
  Lease(#[from] LeaseError),
}
