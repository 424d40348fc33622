/// Errors returned by storage backends.
///
/// Variants mirror the status classes the coordination layer cares about:
/// callers branch on not-found, conflict and transient server failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("not found: {0}")]
  NotFound(String),

  /// The resource is in a conflicting state (already exists, leased by another owner).
  #[error("conflict: {0}")]
  Conflict(String),

  /// A lease or etag condition did not hold.
  #[error("precondition failed: {0}")]
  PreconditionFailed(String),

  #[error("server error ({status}): {message}")]
  Server { status: u16, message: String },

  #[error("operation not supported: {0}")]
  Unsupported(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl StorageError {
  pub fn server(status: u16, message: impl Into<String>) -> Self {
    Self::Server {
      status,
      message: message.into(),
    }
  }

  /// The HTTP-style status this error corresponds to, if any.
  pub fn status(&self) -> Option<u16> {
    match self {
      StorageError::NotFound(_) => Some(404),
      StorageError::Conflict(_) => Some(409),
      StorageError::PreconditionFailed(_) => Some(412),
      StorageError::Server { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Server-side failures (5xx) that are expected to clear on retry.
  pub fn is_transient(&self) -> bool {
    matches!(self, StorageError::Server { status, .. } if *status >= 500)
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, StorageError::NotFound(_))
  }

  pub fn is_conflict(&self) -> bool {
    matches!(self, StorageError::Conflict(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_server_errors_are_transient() {
    assert!(StorageError::server(503, "busy").is_transient());
    assert!(StorageError::server(500, "boom").is_transient());
    assert!(!StorageError::server(429, "throttled").is_transient());
    assert!(!StorageError::Conflict("leased".into()).is_transient());
    assert!(!StorageError::NotFound("x".into()).is_transient());
  }

  #[test]
  fn maps_variants_to_status() {
    assert_eq!(StorageError::NotFound("x".into()).status(), Some(404));
    assert_eq!(StorageError::Conflict("x".into()).status(), Some(409));
    assert_eq!(StorageError::PreconditionFailed("x".into()).status(), Some(412));
    assert_eq!(StorageError::Unsupported("x".into()).status(), None);
  }
}
