use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::{BusMessage, MessageBus, ReceivedMessage};
use crate::error::StorageError;

#[derive(Debug, Clone)]
struct BusEntry {
  message: BusMessage,
  lock_token: Option<String>,
  locked_until: Instant,
  delivery_count: u32,
}

/// In-memory message bus. Entities are created on first send.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageBus {
  entities: Arc<Mutex<HashMap<String, VecDeque<BusEntry>>>>,
}

impl MemoryMessageBus {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn len(&self, entity: &str) -> usize {
    self
      .entities
      .lock()
      .await
      .get(entity)
      .map_or(0, VecDeque::len)
  }
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
  async fn send(&self, entity: &str, message: BusMessage) -> Result<(), StorageError> {
    self
      .entities
      .lock()
      .await
      .entry(entity.to_string())
      .or_default()
      .push_back(BusEntry {
        message,
        lock_token: None,
        locked_until: Instant::now(),
        delivery_count: 0,
      });
    Ok(())
  }

  async fn receive(
    &self,
    entity: &str,
    lock_duration: Duration,
  ) -> Result<Option<ReceivedMessage>, StorageError> {
    let mut entities = self.entities.lock().await;
    let Some(entries) = entities.get_mut(entity) else {
      return Ok(None);
    };

    let now = Instant::now();
    let Some(entry) = entries.iter_mut().find(|e| e.locked_until <= now) else {
      return Ok(None);
    };

    let lock_token = Uuid::new_v4().to_string();
    entry.lock_token = Some(lock_token.clone());
    entry.locked_until = now + lock_duration;
    entry.delivery_count += 1;

    Ok(Some(ReceivedMessage {
      lock_token,
      delivery_count: entry.delivery_count,
      message: entry.message.clone(),
    }))
  }

  async fn complete(&self, entity: &str, lock_token: &str) -> Result<(), StorageError> {
    let mut entities = self.entities.lock().await;
    let entries = entities
      .get_mut(entity)
      .ok_or_else(|| StorageError::NotFound(format!("entity {entity}")))?;

    let position = entries
      .iter()
      .position(|e| e.lock_token.as_deref() == Some(lock_token) && e.locked_until > Instant::now())
      .ok_or_else(|| StorageError::Conflict(format!("lock {lock_token} is not held")))?;
    entries.remove(position);
    Ok(())
  }

  async fn abandon(&self, entity: &str, lock_token: &str) -> Result<(), StorageError> {
    let mut entities = self.entities.lock().await;
    let entries = entities
      .get_mut(entity)
      .ok_or_else(|| StorageError::NotFound(format!("entity {entity}")))?;

    let entry = entries
      .iter_mut()
      .find(|e| e.lock_token.as_deref() == Some(lock_token))
      .ok_or_else(|| StorageError::Conflict(format!("lock {lock_token} is not held")))?;
    entry.lock_token = None;
    entry.locked_until = Instant::now();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const LOCK: Duration = Duration::from_secs(60);

  #[tokio::test(start_paused = true)]
  async fn abandoned_message_is_redelivered() {
    let bus = MemoryMessageBus::new();
    bus.send("events", BusMessage::new("hello")).await.unwrap();

    let first = bus.receive("events", LOCK).await.unwrap().unwrap();
    assert!(bus.receive("events", LOCK).await.unwrap().is_none());

    bus.abandon("events", &first.lock_token).await.unwrap();
    let second = bus.receive("events", LOCK).await.unwrap().unwrap();
    assert_eq!(second.delivery_count, 2);
    assert_eq!(second.message.body, "hello");

    bus.complete("events", &second.lock_token).await.unwrap();
    assert_eq!(bus.len("events").await, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn expired_lock_cannot_complete() {
    let bus = MemoryMessageBus::new();
    bus.send("events", BusMessage::new("hello")).await.unwrap();
    let received = bus.receive("events", LOCK).await.unwrap().unwrap();

    tokio::time::advance(LOCK + Duration::from_secs(1)).await;
    assert!(
      bus
        .complete("events", &received.lock_token)
        .await
        .unwrap_err()
        .is_conflict()
    );
  }

  #[tokio::test]
  async fn unknown_entity_receives_nothing() {
    let bus = MemoryMessageBus::new();
    assert!(bus.receive("nothing", LOCK).await.unwrap().is_none());
  }
}
