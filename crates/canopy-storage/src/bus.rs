use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;

/// A message-bus message: a body plus application properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusMessage {
  pub body: String,
  pub properties: HashMap<String, String>,
}

impl BusMessage {
  pub fn new(body: impl Into<String>) -> Self {
    Self {
      body: body.into(),
      properties: HashMap::new(),
    }
  }
}

/// A message received under a peek-lock.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
  pub lock_token: String,
  pub delivery_count: u32,
  pub message: BusMessage,
}

/// Message-bus backend with peek-lock receive semantics.
#[async_trait]
pub trait MessageBus: Send + Sync {
  async fn send(&self, entity: &str, message: BusMessage) -> Result<(), StorageError>;

  /// Lock the next available message for `lock_duration`.
  async fn receive(
    &self,
    entity: &str,
    lock_duration: Duration,
  ) -> Result<Option<ReceivedMessage>, StorageError>;

  /// Remove a locked message.
  async fn complete(&self, entity: &str, lock_token: &str) -> Result<(), StorageError>;

  /// Release the lock so the message is delivered again.
  async fn abandon(&self, entity: &str, lock_token: &str) -> Result<(), StorageError>;
}
