use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;

/// A message handed out by [`QueueStore::dequeue`].
///
/// `pop_receipt` identifies this particular delivery; it changes every time
/// the message is dequeued or its visibility is updated.
#[derive(Debug, Clone)]
pub struct QueueMessage {
  pub id: String,
  pub pop_receipt: String,
  pub body: String,
  pub dequeue_count: u32,
  pub inserted_at: DateTime<Utc>,
}

/// Queue backend with visibility-timeout delivery.
#[async_trait]
pub trait QueueStore: Send + Sync {
  async fn exists(&self, queue: &str) -> Result<bool, StorageError>;

  async fn create_if_not_exists(&self, queue: &str) -> Result<bool, StorageError>;

  /// Returns the new message id.
  async fn enqueue(&self, queue: &str, body: String) -> Result<String, StorageError>;

  /// Take the next visible message and hide it for `visibility`.
  async fn dequeue(
    &self,
    queue: &str,
    visibility: Duration,
  ) -> Result<Option<QueueMessage>, StorageError>;

  /// Hide the message for `visibility` from now. Returns the new pop receipt.
  /// `NotFound` if the message is gone or the receipt is stale.
  async fn update_visibility(
    &self,
    queue: &str,
    message_id: &str,
    pop_receipt: &str,
    visibility: Duration,
  ) -> Result<String, StorageError>;

  async fn delete(
    &self,
    queue: &str,
    message_id: &str,
    pop_receipt: &str,
  ) -> Result<(), StorageError>;
}
