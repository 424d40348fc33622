use std::time::Duration;

use canopy_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
  /// The lease could not be renewed and must be treated as lost.
  #[error("lease on '{lock_id}' was lost: {source}")]
  RenewalFailed {
    lock_id: String,
    #[source]
    source: StorageError,
  },

  #[error("timed out after {timeout:?} waiting for lock '{lock_id}'")]
  AcquisitionTimeout { lock_id: String, timeout: Duration },

  #[error("lock acquisition cancelled")]
  Cancelled,

  #[error("storage error: {0}")]
  Storage(#[from] StorageError),
}
