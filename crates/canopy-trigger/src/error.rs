use canopy_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
  #[error("invalid path pattern '{pattern}': {message}")]
  Invalid { pattern: String, message: String },

  #[error("no value bound for '{{{name}}}' in pattern '{pattern}'")]
  Unbound { pattern: String, name: String },

  #[error("pattern '{pattern}' produced invalid blob path '{path}'")]
  InvalidPath { pattern: String, path: String },
}

impl PatternError {
  pub(crate) fn invalid(pattern: &str, message: impl Into<String>) -> Self {
    Self::Invalid {
      pattern: pattern.to_string(),
      message: message.into(),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
  #[error("invalid trigger for function '{function}': {message}")]
  Invalid { function: String, message: String },

  #[error(transparent)]
  Pattern(#[from] PatternError),

  #[error("storage error: {0}")]
  Storage(#[from] StorageError),
}

impl TriggerError {
  pub(crate) fn invalid(function: &str, message: impl Into<String>) -> Self {
    Self::Invalid {
      function: function.to_string(),
      message: message.into(),
    }
  }
}
