use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::function::FunctionDef;

/// Top-level host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
  /// Identifies the host for lock ids. Hosts sharing an id compete for the
  /// same singleton locks.
  pub host_id: String,
  #[serde(default)]
  pub blob: BlobListenerConfig,
  #[serde(default)]
  pub queues: QueueConfig,
  #[serde(default)]
  pub singleton: SingletonConfig,
  #[serde(default)]
  pub functions: Vec<FunctionDef>,
}

impl HostConfig {
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }
}

/// How the blob listener discovers changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobStrategy {
  /// Change log when the account provides one, full scan otherwise.
  #[default]
  Auto,
  FullScan,
  ChangeLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobListenerConfig {
  pub poll_interval_ms: u64,
  pub strategy: BlobStrategy,
}

impl Default for BlobListenerConfig {
  fn default() -> Self {
    Self {
      poll_interval_ms: 10_000,
      strategy: BlobStrategy::Auto,
    }
  }
}

impl BlobListenerConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// How long a dequeued message stays invisible to other consumers.
  pub visibility_timeout_ms: u64,
  pub min_renewal_interval_ms: u64,
  pub max_renewal_interval_ms: u64,
  pub min_polling_interval_ms: u64,
  pub max_polling_interval_ms: u64,
  /// A message that fails on this delivery or later is moved to
  /// `{queue}-poison` instead of being retried again.
  pub max_dequeue_count: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      visibility_timeout_ms: 600_000,
      min_renewal_interval_ms: 60_000,
      max_renewal_interval_ms: 300_000,
      min_polling_interval_ms: 100,
      max_polling_interval_ms: 60_000,
      max_dequeue_count: 5,
    }
  }
}

impl QueueConfig {
  pub fn visibility_timeout(&self) -> Duration {
    Duration::from_millis(self.visibility_timeout_ms)
  }

  pub fn min_renewal_interval(&self) -> Duration {
    Duration::from_millis(self.min_renewal_interval_ms)
  }

  pub fn max_renewal_interval(&self) -> Duration {
    Duration::from_millis(self.max_renewal_interval_ms)
  }

  pub fn min_polling_interval(&self) -> Duration {
    Duration::from_millis(self.min_polling_interval_ms)
  }

  pub fn max_polling_interval(&self) -> Duration {
    Duration::from_millis(self.max_polling_interval_ms)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingletonConfig {
  pub lock_period_ms: u64,
  pub listener_lock_period_ms: u64,
  pub acquisition_timeout_ms: u64,
  pub acquisition_polling_interval_ms: u64,
  pub min_renewal_interval_ms: u64,
  /// Only one host with this `host_id` runs listeners at a time.
  pub listener_singleton: bool,
  /// Account holding the lock blobs. Defaults to the default account.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub lock_account: Option<String>,
}

impl Default for SingletonConfig {
  fn default() -> Self {
    Self {
      lock_period_ms: 15_000,
      listener_lock_period_ms: 60_000,
      acquisition_timeout_ms: 60_000,
      acquisition_polling_interval_ms: 5_000,
      min_renewal_interval_ms: 1_000,
      listener_singleton: false,
      lock_account: None,
    }
  }
}

impl SingletonConfig {
  pub fn lock_period(&self) -> Duration {
    Duration::from_millis(self.lock_period_ms)
  }

  pub fn listener_lock_period(&self) -> Duration {
    Duration::from_millis(self.listener_lock_period_ms)
  }

  pub fn acquisition_timeout(&self) -> Duration {
    Duration::from_millis(self.acquisition_timeout_ms)
  }

  pub fn acquisition_polling_interval(&self) -> Duration {
    Duration::from_millis(self.acquisition_polling_interval_ms)
  }

  pub fn min_renewal_interval(&self) -> Duration {
    Duration::from_millis(self.min_renewal_interval_ms)
  }
}
