use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::blob::{BlobItem, BlobProperties, BlobStore, ChangeLogBatch};
use crate::error::StorageError;
use crate::log::{BlobOperation, format_log_line};
use crate::memory::LeaseTable;
use crate::resource::BlobPath;

#[derive(Debug, Clone)]
struct StoredBlob {
  data: Bytes,
  metadata: HashMap<String, String>,
  last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
  containers: HashMap<String, BTreeMap<String, StoredBlob>>,
  leases: LeaseTable,
  log: Vec<String>,
}

/// In-memory blob store.
///
/// With [`MemoryBlobStore::with_change_log`] every write is also appended to a
/// storage write log, which makes the store usable with the change-log
/// listener strategy.
#[derive(Debug, Clone)]
pub struct MemoryBlobStore {
  account: String,
  change_log: bool,
  inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryBlobStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryBlobStore {
  pub fn new() -> Self {
    Self {
      account: "memory".to_string(),
      change_log: false,
      inner: Arc::default(),
    }
  }

  /// A store that records writes in a change log under the given account name.
  pub fn with_change_log(account: impl Into<String>) -> Self {
    Self {
      account: account.into(),
      change_log: true,
      inner: Arc::default(),
    }
  }

  /// Override a blob's last-modified time. Intended for tests that need
  /// precise timestamps.
  pub async fn set_last_modified(
    &self,
    path: &BlobPath,
    last_modified: DateTime<Utc>,
  ) -> Result<(), StorageError> {
    let mut inner = self.inner.lock().await;
    let blob = inner
      .containers
      .get_mut(&path.container)
      .and_then(|blobs| blobs.get_mut(&path.blob))
      .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
    blob.last_modified = last_modified;
    Ok(())
  }

  fn record(&self, inner: &mut Inner, operation: BlobOperation, path: &BlobPath) {
    if self.change_log {
      inner
        .log
        .push(format_log_line(Utc::now(), &operation, &self.account, path));
    }
  }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
  async fn create_container_if_not_exists(&self, container: &str) -> Result<bool, StorageError> {
    let mut inner = self.inner.lock().await;
    if inner.containers.contains_key(container) {
      return Ok(false);
    }
    inner
      .containers
      .insert(container.to_string(), BTreeMap::new());
    Ok(true)
  }

  async fn list_blobs(&self, container: &str) -> Result<Vec<BlobItem>, StorageError> {
    let inner = self.inner.lock().await;
    let blobs = inner
      .containers
      .get(container)
      .ok_or_else(|| StorageError::NotFound(container.to_string()))?;

    Ok(
      blobs
        .iter()
        .map(|(name, blob)| BlobItem {
          path: BlobPath::new(container, name.clone()),
          last_modified: blob.last_modified,
        })
        .collect(),
    )
  }

  async fn properties(&self, path: &BlobPath) -> Result<Option<BlobProperties>, StorageError> {
    let inner = self.inner.lock().await;
    let Some(blob) = inner
      .containers
      .get(&path.container)
      .and_then(|blobs| blobs.get(&path.blob))
    else {
      return Ok(None);
    };

    Ok(Some(BlobProperties {
      last_modified: blob.last_modified,
      content_length: blob.data.len() as u64,
      metadata: blob.metadata.clone(),
      lease_state: inner.leases.state(path),
    }))
  }

  async fn upload(
    &self,
    path: &BlobPath,
    data: Bytes,
    overwrite: bool,
  ) -> Result<(), StorageError> {
    let mut inner = self.inner.lock().await;
    inner.leases.check_write(path, None)?;

    let blobs = inner
      .containers
      .get_mut(&path.container)
      .ok_or_else(|| StorageError::NotFound(path.container.clone()))?;
    if !overwrite && blobs.contains_key(&path.blob) {
      return Err(StorageError::Conflict(format!("{path} already exists")));
    }

    blobs.insert(
      path.blob.clone(),
      StoredBlob {
        data,
        metadata: HashMap::new(),
        last_modified: Utc::now(),
      },
    );
    self.record(&mut inner, BlobOperation::PutBlob, path);
    Ok(())
  }

  async fn download(&self, path: &BlobPath) -> Result<Bytes, StorageError> {
    let inner = self.inner.lock().await;
    inner
      .containers
      .get(&path.container)
      .and_then(|blobs| blobs.get(&path.blob))
      .map(|blob| blob.data.clone())
      .ok_or_else(|| StorageError::NotFound(path.to_string()))
  }

  async fn set_metadata(
    &self,
    path: &BlobPath,
    metadata: HashMap<String, String>,
    lease_id: Option<&str>,
  ) -> Result<(), StorageError> {
    let mut inner = self.inner.lock().await;
    inner.leases.check_write(path, lease_id)?;

    let blob = inner
      .containers
      .get_mut(&path.container)
      .and_then(|blobs| blobs.get_mut(&path.blob))
      .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
    blob.metadata = metadata;
    blob.last_modified = Utc::now();
    self.record(&mut inner, BlobOperation::SetBlobMetadata, path);
    Ok(())
  }

  async fn acquire_lease(
    &self,
    path: &BlobPath,
    duration: Duration,
    proposed_lease_id: Option<&str>,
  ) -> Result<String, StorageError> {
    let mut inner = self.inner.lock().await;
    let exists = inner
      .containers
      .get(&path.container)
      .is_some_and(|blobs| blobs.contains_key(&path.blob));
    if !exists {
      return Err(StorageError::NotFound(path.to_string()));
    }
    inner.leases.acquire(path, duration, proposed_lease_id)
  }

  async fn renew_lease(&self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError> {
    self.inner.lock().await.leases.renew(path, lease_id)
  }

  async fn release_lease(&self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError> {
    self.inner.lock().await.leases.release(path, lease_id)
  }

  fn supports_change_log(&self) -> bool {
    self.change_log
  }

  async fn read_change_log(&self, cursor: u64) -> Result<ChangeLogBatch, StorageError> {
    if !self.change_log {
      return Err(StorageError::Unsupported("change log".to_string()));
    }
    let inner = self.inner.lock().await;
    let start = (cursor as usize).min(inner.log.len());
    Ok(ChangeLogBatch {
      lines: inner.log[start..].to_vec(),
      cursor: inner.log.len() as u64,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::log::LogRow;

  #[tokio::test]
  async fn upload_requires_container() {
    let store = MemoryBlobStore::new();
    let path = BlobPath::new("input", "a.txt");

    let err = store
      .upload(&path, Bytes::from_static(b"x"), true)
      .await
      .unwrap_err();
    assert!(err.is_not_found());

    store.create_container_if_not_exists("input").await.unwrap();
    store
      .upload(&path, Bytes::from_static(b"x"), true)
      .await
      .unwrap();
    assert_eq!(store.download(&path).await.unwrap(), Bytes::from_static(b"x"));
  }

  #[tokio::test]
  async fn upload_without_overwrite_conflicts() {
    let store = MemoryBlobStore::new();
    let path = BlobPath::new("input", "a.txt");
    store.create_container_if_not_exists("input").await.unwrap();
    store.upload(&path, Bytes::new(), false).await.unwrap();

    let err = store.upload(&path, Bytes::new(), false).await.unwrap_err();
    assert!(err.is_conflict());
  }

  #[tokio::test]
  async fn leased_blob_rejects_metadata_without_lease() {
    let store = MemoryBlobStore::new();
    let path = BlobPath::new("locks", "a");
    store.create_container_if_not_exists("locks").await.unwrap();
    store.upload(&path, Bytes::new(), false).await.unwrap();

    let lease = store
      .acquire_lease(&path, Duration::from_secs(15), None)
      .await
      .unwrap();
    let metadata = HashMap::from([("owner".to_string(), "me".to_string())]);

    assert!(matches!(
      store.set_metadata(&path, metadata.clone(), None).await,
      Err(StorageError::PreconditionFailed(_))
    ));
    store
      .set_metadata(&path, metadata, Some(lease.as_str()))
      .await
      .unwrap();

    let props = store.properties(&path).await.unwrap().unwrap();
    assert_eq!(props.metadata.get("owner").map(String::as_str), Some("me"));
  }

  #[tokio::test]
  async fn change_log_records_writes_from_cursor() {
    let store = MemoryBlobStore::with_change_log("dev");
    store.create_container_if_not_exists("input").await.unwrap();
    store
      .upload(&BlobPath::new("input", "a"), Bytes::new(), true)
      .await
      .unwrap();

    let first = store.read_change_log(0).await.unwrap();
    assert_eq!(first.lines.len(), 1);
    assert_eq!(first.cursor, 1);

    store
      .upload(&BlobPath::new("input", "b"), Bytes::new(), true)
      .await
      .unwrap();
    let second = store.read_change_log(first.cursor).await.unwrap();
    assert_eq!(second.lines.len(), 1);

    let row = LogRow::parse(&second.lines[0]).unwrap();
    assert_eq!(row.account(), Some("dev"));
    assert_eq!(row.blob_path(), Some(BlobPath::new("input", "b")));
  }

  #[tokio::test]
  async fn plain_store_has_no_change_log() {
    let store = MemoryBlobStore::new();
    assert!(!store.supports_change_log());
    assert!(matches!(
      store.read_change_log(0).await,
      Err(StorageError::Unsupported(_))
    ));
  }
}
