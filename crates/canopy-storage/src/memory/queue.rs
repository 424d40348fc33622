use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::StorageError;
use crate::queue::{QueueMessage, QueueStore};

#[derive(Debug, Clone)]
struct QueueEntry {
  id: String,
  body: String,
  pop_receipt: Option<String>,
  visible_at: Instant,
  dequeue_count: u32,
  inserted_at: DateTime<Utc>,
}

/// In-memory queue store with visibility timeouts.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
  queues: Arc<Mutex<HashMap<String, VecDeque<QueueEntry>>>>,
}

impl MemoryQueueStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of messages in the queue, visible or not.
  pub async fn len(&self, queue: &str) -> usize {
    self
      .queues
      .lock()
      .await
      .get(queue)
      .map_or(0, VecDeque::len)
  }

  fn not_found(queue: &str) -> StorageError {
    StorageError::NotFound(format!("queue {queue}"))
  }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
  async fn exists(&self, queue: &str) -> Result<bool, StorageError> {
    Ok(self.queues.lock().await.contains_key(queue))
  }

  async fn create_if_not_exists(&self, queue: &str) -> Result<bool, StorageError> {
    let mut queues = self.queues.lock().await;
    if queues.contains_key(queue) {
      return Ok(false);
    }
    queues.insert(queue.to_string(), VecDeque::new());
    Ok(true)
  }

  async fn enqueue(&self, queue: &str, body: String) -> Result<String, StorageError> {
    let mut queues = self.queues.lock().await;
    let entries = queues.get_mut(queue).ok_or_else(|| Self::not_found(queue))?;

    let id = Uuid::new_v4().to_string();
    entries.push_back(QueueEntry {
      id: id.clone(),
      body,
      pop_receipt: None,
      visible_at: Instant::now(),
      dequeue_count: 0,
      inserted_at: Utc::now(),
    });
    Ok(id)
  }

  async fn dequeue(
    &self,
    queue: &str,
    visibility: Duration,
  ) -> Result<Option<QueueMessage>, StorageError> {
    let mut queues = self.queues.lock().await;
    let entries = queues.get_mut(queue).ok_or_else(|| Self::not_found(queue))?;

    let now = Instant::now();
    let Some(entry) = entries.iter_mut().find(|e| e.visible_at <= now) else {
      return Ok(None);
    };

    let pop_receipt = Uuid::new_v4().to_string();
    entry.pop_receipt = Some(pop_receipt.clone());
    entry.visible_at = now + visibility;
    entry.dequeue_count += 1;

    Ok(Some(QueueMessage {
      id: entry.id.clone(),
      pop_receipt,
      body: entry.body.clone(),
      dequeue_count: entry.dequeue_count,
      inserted_at: entry.inserted_at,
    }))
  }

  async fn update_visibility(
    &self,
    queue: &str,
    message_id: &str,
    pop_receipt: &str,
    visibility: Duration,
  ) -> Result<String, StorageError> {
    let mut queues = self.queues.lock().await;
    let entries = queues.get_mut(queue).ok_or_else(|| Self::not_found(queue))?;

    let entry = entries
      .iter_mut()
      .find(|e| e.id == message_id && e.pop_receipt.as_deref() == Some(pop_receipt))
      .ok_or_else(|| StorageError::NotFound(format!("message {message_id}")))?;

    let receipt = Uuid::new_v4().to_string();
    entry.pop_receipt = Some(receipt.clone());
    entry.visible_at = Instant::now() + visibility;
    Ok(receipt)
  }

  async fn delete(
    &self,
    queue: &str,
    message_id: &str,
    pop_receipt: &str,
  ) -> Result<(), StorageError> {
    let mut queues = self.queues.lock().await;
    let entries = queues.get_mut(queue).ok_or_else(|| Self::not_found(queue))?;

    let position = entries
      .iter()
      .position(|e| e.id == message_id && e.pop_receipt.as_deref() == Some(pop_receipt))
      .ok_or_else(|| StorageError::NotFound(format!("message {message_id}")))?;
    entries.remove(position);
    Ok(())
  }
}
