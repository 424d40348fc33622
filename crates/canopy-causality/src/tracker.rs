//! Parent invocation ids carried in blob metadata, queue payloads and bus
//! message properties.

use bytes::Bytes;
use canopy_storage::{
  BlobPath, BusMessage, EntityRef, QueueMessage, QueueRef, StorageAccounts, StorageError,
};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

pub const PARENT_ID_METADATA_KEY: &str = "CanopyParentId";
pub const PARENT_ID_FIELD: &str = "$CanopyParentId";

/// A resource whose producer can be looked up.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
  Blob {
    account: &'a str,
    path: &'a BlobPath,
  },
  QueueMessage(&'a QueueMessage),
  BusMessage(&'a BusMessage),
}

#[derive(Clone)]
pub struct CausalityTracker {
  accounts: StorageAccounts,
}

impl CausalityTracker {
  pub fn new(accounts: StorageAccounts) -> Self {
    Self { accounts }
  }

  /// Record `instance` as the producer of an existing blob.
  pub async fn stamp_blob(&self, account: &str, path: &BlobPath, instance: Uuid) {
    if let Err(e) = self.try_stamp_blob(account, path, instance).await {
      warn!(blob = %path, instance_id = %instance, error = %e, "failed to stamp blob lineage");
    }
  }

  async fn try_stamp_blob(
    &self,
    account: &str,
    path: &BlobPath,
    instance: Uuid,
  ) -> Result<(), StorageError> {
    let store = self.accounts.get(Some(account))?.blobs()?;
    let props = store
      .properties(path)
      .await?
      .ok_or_else(|| StorageError::NotFound(path.to_string()))?;

    let mut metadata = props.metadata;
    metadata.insert(PARENT_ID_METADATA_KEY.to_string(), instance.to_string());
    store.set_metadata(path, metadata, None).await
  }

  /// Upload blob content, then stamp it. The upload error is returned;
  /// stamping failures are only logged.
  pub async fn write_blob(
    &self,
    account: &str,
    path: &BlobPath,
    data: Bytes,
    instance: Uuid,
  ) -> Result<(), StorageError> {
    let store = self.accounts.get(Some(account))?.blobs()?;
    store.upload(path, data, true).await?;
    self.stamp_blob(account, path, instance).await;
    Ok(())
  }

  /// Embed the producer in a JSON object payload. Other payloads are
  /// returned unchanged.
  pub fn stamp_queue_payload(body: &str, instance: Uuid) -> String {
    match serde_json::from_str::<Value>(body) {
      Ok(Value::Object(mut object)) => {
        object.insert(
          PARENT_ID_FIELD.to_string(),
          Value::String(instance.to_string()),
        );
        Value::Object(object).to_string()
      }
      _ => body.to_string(),
    }
  }

  pub async fn enqueue(
    &self,
    queue: &QueueRef,
    body: &str,
    instance: Uuid,
  ) -> Result<String, StorageError> {
    let store = self.accounts.get(Some(queue.account()))?.queues()?;
    store
      .enqueue(queue.name(), Self::stamp_queue_payload(body, instance))
      .await
  }

  pub fn stamp_bus_message(message: &mut BusMessage, instance: Uuid) {
    message
      .properties
      .insert(PARENT_ID_FIELD.to_string(), instance.to_string());
  }

  pub async fn send(
    &self,
    entity: &EntityRef,
    mut message: BusMessage,
    instance: Uuid,
  ) -> Result<(), StorageError> {
    let bus = self.accounts.get(Some(entity.account()))?.bus()?;
    Self::stamp_bus_message(&mut message, instance);
    bus.send(entity.path(), message).await
  }

  /// The instance that produced `resource`.
  ///
  /// Returns `None` both when the resource carries no lineage and when it
  /// does not exist; callers cannot tell the two apart.
  pub async fn owner(&self, resource: Resource<'_>) -> Option<Uuid> {
    match resource {
      Resource::Blob { account, path } => self.blob_owner(account, path).await,
      Resource::QueueMessage(message) => queue_owner(&message.body),
      Resource::BusMessage(message) => message
        .properties
        .get(PARENT_ID_FIELD)
        .and_then(|value| Uuid::parse_str(value).ok()),
    }
  }

  async fn blob_owner(&self, account: &str, path: &BlobPath) -> Option<Uuid> {
    let store = match self.accounts.get(Some(account)).and_then(|a| a.blobs()) {
      Ok(store) => store,
      Err(e) => {
        warn!(blob = %path, error = %e, "failed to read blob lineage");
        return None;
      }
    };

    match store.properties(path).await {
      Ok(props) => props?
        .metadata
        .get(PARENT_ID_METADATA_KEY)
        .and_then(|value| Uuid::parse_str(value).ok()),
      Err(e) => {
        warn!(blob = %path, error = %e, "failed to read blob lineage");
        None
      }
    }
  }
}

fn queue_owner(body: &str) -> Option<Uuid> {
  let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) else {
    return None;
  };
  object
    .get(PARENT_ID_FIELD)
    .and_then(Value::as_str)
    .and_then(|value| Uuid::parse_str(value).ok())
}
