use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::resource::BlobPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
  Available,
  Leased,
}

#[derive(Debug, Clone)]
pub struct BlobProperties {
  pub last_modified: DateTime<Utc>,
  pub content_length: u64,
  pub metadata: HashMap<String, String>,
  pub lease_state: LeaseState,
}

/// A blob seen while listing a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobItem {
  pub path: BlobPath,
  pub last_modified: DateTime<Utc>,
}

/// Lines read from a storage write log, plus the cursor to resume from.
#[derive(Debug, Clone, Default)]
pub struct ChangeLogBatch {
  pub lines: Vec<String>,
  pub cursor: u64,
}

/// Blob storage backend.
#[async_trait]
pub trait BlobStore: Send + Sync {
  /// Returns true if the container was created by this call.
  async fn create_container_if_not_exists(&self, container: &str) -> Result<bool, StorageError>;

  /// List every blob in a container. Fails with `NotFound` if the container
  /// does not exist.
  async fn list_blobs(&self, container: &str) -> Result<Vec<BlobItem>, StorageError>;

  /// Properties of a blob, or `None` if it does not exist.
  async fn properties(&self, path: &BlobPath) -> Result<Option<BlobProperties>, StorageError>;

  /// Write a blob. With `overwrite` false an existing blob yields `Conflict`.
  /// A missing container yields `NotFound`.
  async fn upload(
    &self,
    path: &BlobPath,
    data: Bytes,
    overwrite: bool,
  ) -> Result<(), StorageError>;

  async fn download(&self, path: &BlobPath) -> Result<Bytes, StorageError>;

  /// Replace the blob's metadata. A leased blob requires the matching lease id.
  async fn set_metadata(
    &self,
    path: &BlobPath,
    metadata: HashMap<String, String>,
    lease_id: Option<&str>,
  ) -> Result<(), StorageError>;

  /// Acquire a lease. `Conflict` if another lease is active, `NotFound` if
  /// the blob does not exist. Returns the lease id.
  async fn acquire_lease(
    &self,
    path: &BlobPath,
    duration: Duration,
    proposed_lease_id: Option<&str>,
  ) -> Result<String, StorageError>;

  /// Extend a lease by its original duration. `Conflict` if the lease was lost.
  async fn renew_lease(&self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError>;

  async fn release_lease(&self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError>;

  /// Whether [`BlobStore::read_change_log`] is available for this account.
  fn supports_change_log(&self) -> bool {
    false
  }

  /// Read storage write-log lines recorded after `cursor`.
  async fn read_change_log(&self, _cursor: u64) -> Result<ChangeLogBatch, StorageError> {
    Err(StorageError::Unsupported("change log".to_string()))
  }
}
