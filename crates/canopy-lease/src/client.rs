use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use canopy_storage::{BlobPath, BlobProperties, BlobStore, StorageAccounts, StorageError};

use crate::error::LeaseError;

/// Lease operations on the placeholder blob behind one lock.
#[async_trait]
pub trait LeaseClient: Send + Sync {
  fn path(&self) -> &BlobPath;

  /// Create the empty placeholder blob, and its container if needed.
  /// Losing the creation race to another host is not an error.
  async fn create_if_not_exists(&self) -> Result<(), StorageError>;

  async fn acquire(
    &self,
    period: Duration,
    proposed_lease_id: Option<&str>,
  ) -> Result<String, StorageError>;

  async fn renew(&self, lease_id: &str) -> Result<(), StorageError>;

  async fn release(&self, lease_id: &str) -> Result<(), StorageError>;

  /// Record `value` under `key` in the blob metadata, guarded by the lease.
  async fn set_metadata_entry(
    &self,
    lease_id: &str,
    key: &str,
    value: &str,
  ) -> Result<(), StorageError>;

  async fn properties(&self) -> Result<Option<BlobProperties>, StorageError>;
}

/// Produces lease clients for `(account, lock_id)` pairs.
pub trait LeaseClientFactory: Send + Sync {
  fn client(&self, account: &str, lock_id: &str) -> Result<Arc<dyn LeaseClient>, LeaseError>;
}

pub struct BlobLeaseClient {
  store: Arc<dyn BlobStore>,
  path: BlobPath,
}

impl BlobLeaseClient {
  pub fn new(store: Arc<dyn BlobStore>, path: BlobPath) -> Self {
    Self { store, path }
  }
}

#[async_trait]
impl LeaseClient for BlobLeaseClient {
  fn path(&self) -> &BlobPath {
    &self.path
  }

  async fn create_if_not_exists(&self) -> Result<(), StorageError> {
    let result = match self.store.upload(&self.path, Bytes::new(), false).await {
      Err(e) if e.is_not_found() => {
        self
          .store
          .create_container_if_not_exists(&self.path.container)
          .await?;
        self.store.upload(&self.path, Bytes::new(), false).await
      }
      other => other,
    };

    match result {
      Ok(()) => Ok(()),
      // Another host created it first, and may already hold the lease.
      Err(StorageError::Conflict(_)) | Err(StorageError::PreconditionFailed(_)) => Ok(()),
      Err(e) => Err(e),
    }
  }

  async fn acquire(
    &self,
    period: Duration,
    proposed_lease_id: Option<&str>,
  ) -> Result<String, StorageError> {
    self
      .store
      .acquire_lease(&self.path, period, proposed_lease_id)
      .await
  }

  async fn renew(&self, lease_id: &str) -> Result<(), StorageError> {
    self.store.renew_lease(&self.path, lease_id).await
  }

  async fn release(&self, lease_id: &str) -> Result<(), StorageError> {
    self.store.release_lease(&self.path, lease_id).await
  }

  async fn set_metadata_entry(
    &self,
    lease_id: &str,
    key: &str,
    value: &str,
  ) -> Result<(), StorageError> {
    let mut metadata = match self.store.properties(&self.path).await? {
      Some(props) => props.metadata,
      None => HashMap::new(),
    };
    metadata.insert(key.to_string(), value.to_string());
    self
      .store
      .set_metadata(&self.path, metadata, Some(lease_id))
      .await
  }

  async fn properties(&self) -> Result<Option<BlobProperties>, StorageError> {
    self.store.properties(&self.path).await
  }
}

/// Default factory: locks live at `{container}/locks/{lock_id}` in the
/// account's blob store.
pub struct BlobLeaseClientFactory {
  accounts: StorageAccounts,
  container: String,
}

impl BlobLeaseClientFactory {
  pub fn new(accounts: StorageAccounts, container: impl Into<String>) -> Self {
    Self {
      accounts,
      container: container.into(),
    }
  }
}

impl LeaseClientFactory for BlobLeaseClientFactory {
  fn client(&self, account: &str, lock_id: &str) -> Result<Arc<dyn LeaseClient>, LeaseError> {
    let store = self.accounts.get(Some(account))?.blobs()?;
    let path = BlobPath::new(self.container.clone(), format!("locks/{lock_id}"));
    Ok(Arc::new(BlobLeaseClient::new(store, path)))
  }
}
