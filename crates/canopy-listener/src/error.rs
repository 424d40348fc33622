use canopy_lease::LeaseError;
use canopy_storage::StorageError;
use canopy_trigger::TriggerError;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
  #[error(transparent)]
  Trigger(#[from] TriggerError),

  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("lease error: {0}")]
  Lease(#[from] LeaseError),

  #[error("invalid listener configuration: {0}")]
  Config(String),

  #[error("host is already started")]
  AlreadyStarted,

  #[error("unknown function '{0}'")]
  UnknownFunction(String),
}

impl ListenerError {
  /// Storage failures expected to clear on retry.
  pub fn is_transient(&self) -> bool {
    match self {
      ListenerError::Storage(e) | ListenerError::Trigger(TriggerError::Storage(e)) => {
        e.is_transient()
      }
      _ => false,
    }
  }
}
