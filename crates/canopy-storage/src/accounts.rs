use std::collections::HashMap;
use std::sync::Arc;

use crate::blob::BlobStore;
use crate::bus::MessageBus;
use crate::error::StorageError;
use crate::memory::{MemoryBlobStore, MemoryMessageBus, MemoryQueueStore};
use crate::queue::QueueStore;

/// The backends reachable through one storage account.
#[derive(Clone)]
pub struct StorageAccount {
  name: String,
  blobs: Option<Arc<dyn BlobStore>>,
  queues: Option<Arc<dyn QueueStore>>,
  bus: Option<Arc<dyn MessageBus>>,
}

impl std::fmt::Debug for StorageAccount {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StorageAccount")
      .field("name", &self.name)
      .field("blobs", &self.blobs.is_some())
      .field("queues", &self.queues.is_some())
      .field("bus", &self.bus.is_some())
      .finish()
  }
}

impl StorageAccount {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      blobs: None,
      queues: None,
      bus: None,
    }
  }

  /// An account backed entirely by in-memory stores, with a blob change log.
  pub fn memory(name: impl Into<String>) -> Self {
    let name = name.into();
    Self::new(name.clone())
      .with_blobs(Arc::new(MemoryBlobStore::with_change_log(name)))
      .with_queues(Arc::new(MemoryQueueStore::new()))
      .with_bus(Arc::new(MemoryMessageBus::new()))
  }

  pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
    self.blobs = Some(blobs);
    self
  }

  pub fn with_queues(mut self, queues: Arc<dyn QueueStore>) -> Self {
    self.queues = Some(queues);
    self
  }

  pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
    self.bus = Some(bus);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn blobs(&self) -> Result<Arc<dyn BlobStore>, StorageError> {
    self
      .blobs
      .clone()
      .ok_or_else(|| StorageError::Unsupported(format!("account {} has no blob store", self.name)))
  }

  pub fn queues(&self) -> Result<Arc<dyn QueueStore>, StorageError> {
    self
      .queues
      .clone()
      .ok_or_else(|| StorageError::Unsupported(format!("account {} has no queue store", self.name)))
  }

  pub fn bus(&self) -> Result<Arc<dyn MessageBus>, StorageError> {
    self
      .bus
      .clone()
      .ok_or_else(|| StorageError::Unsupported(format!("account {} has no message bus", self.name)))
  }
}

/// Account registry. Triggers that name no account use the default one.
#[derive(Clone)]
pub struct StorageAccounts {
  default: String,
  accounts: HashMap<String, StorageAccount>,
}

impl StorageAccounts {
  pub fn new(default: StorageAccount) -> Self {
    let name = default.name.clone();
    Self {
      default: name.clone(),
      accounts: HashMap::from([(name, default)]),
    }
  }

  pub fn with_account(mut self, account: StorageAccount) -> Self {
    self.accounts.insert(account.name.clone(), account);
    self
  }

  pub fn default_name(&self) -> &str {
    &self.default
  }

  /// Look up an account by name, or the default account for `None`.
  pub fn get(&self, name: Option<&str>) -> Result<&StorageAccount, StorageError> {
    let name = name.unwrap_or(&self.default);
    self
      .accounts
      .get(name)
      .ok_or_else(|| StorageError::NotFound(format!("storage account {name}")))
  }

  pub fn iter(&self) -> impl Iterator<Item = &StorageAccount> {
    self.accounts.values()
  }
}
