//! Named locks backed by blob leases, with owner metadata on the lock blob.

use std::sync::Arc;
use std::time::Duration;

use canopy_storage::{LeaseState, StorageAccounts};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::client::{BlobLeaseClientFactory, LeaseClient, LeaseClientFactory};
use crate::error::LeaseError;

/// Container holding lock placeholder blobs.
pub const LOCK_CONTAINER: &str = "canopy-hosts";

/// Metadata key recording the current lock holder.
pub const OWNER_METADATA_KEY: &str = "CanopyLockOwner";

#[derive(Debug, Clone, Copy)]
struct RenewalStats {
  last_renewal: DateTime<Utc>,
  last_latency: Duration,
}

/// A held lease. Renewal statistics are updated on each successful renewal.
pub struct LeaseHandle {
  lock_id: String,
  lease_id: String,
  lease_period: Duration,
  client: Arc<dyn LeaseClient>,
  stats: Mutex<RenewalStats>,
}

impl LeaseHandle {
  pub fn lock_id(&self) -> &str {
    &self.lock_id
  }

  pub fn lease_id(&self) -> &str {
    &self.lease_id
  }

  pub fn lease_period(&self) -> Duration {
    self.lease_period
  }

  pub async fn last_renewal(&self) -> DateTime<Utc> {
    self.stats.lock().await.last_renewal
  }

  pub async fn last_renewal_latency(&self) -> Duration {
    self.stats.lock().await.last_latency
  }
}

impl std::fmt::Debug for LeaseHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeaseHandle")
      .field("lock_id", &self.lock_id)
      .field("lease_id", &self.lease_id)
      .field("lease_period", &self.lease_period)
      .finish()
  }
}

/// Acquires and maintains named leases.
#[derive(Clone)]
pub struct LeaseLockManager {
  factory: Arc<dyn LeaseClientFactory>,
}

impl LeaseLockManager {
  pub fn new(factory: Arc<dyn LeaseClientFactory>) -> Self {
    Self { factory }
  }

  /// Manager using blob leases in [`LOCK_CONTAINER`] of each account.
  pub fn for_accounts(accounts: StorageAccounts) -> Self {
    Self::new(Arc::new(BlobLeaseClientFactory::new(accounts, LOCK_CONTAINER)))
  }

  /// Try to take the lock without waiting.
  ///
  /// Returns `None` when another holder has it. A missing placeholder blob is
  /// created and acquisition retried once. When `owner_id` is given it is
  /// written to the blob metadata under the new lease.
  #[instrument(name = "lease.try_lock", skip(self, owner_id, proposed_lease_id))]
  pub async fn try_lock(
    &self,
    account: &str,
    lock_id: &str,
    owner_id: Option<&str>,
    proposed_lease_id: Option<&str>,
    lease_period: Duration,
  ) -> Result<Option<LeaseHandle>, LeaseError> {
    let client = self.factory.client(account, lock_id)?;

    let lease_id = match client.acquire(lease_period, proposed_lease_id).await {
      Ok(id) => id,
      Err(e) if e.is_conflict() => return Ok(None),
      Err(e) if e.is_not_found() => {
        client.create_if_not_exists().await?;
        match client.acquire(lease_period, proposed_lease_id).await {
          Ok(id) => id,
          Err(e) if e.is_conflict() => return Ok(None),
          Err(e) => return Err(e.into()),
        }
      }
      Err(e) => return Err(e.into()),
    };

    if let Some(owner) = owner_id
      && let Err(e) = client
        .set_metadata_entry(&lease_id, OWNER_METADATA_KEY, owner)
        .await
    {
      if let Err(release_error) = client.release(&lease_id).await {
        warn!(error = %release_error, "failed to release lease after owner write failed");
      }
      return Err(e.into());
    }

    debug!(lease_id = %lease_id, "lease acquired");
    Ok(Some(LeaseHandle {
      lock_id: lock_id.to_string(),
      lease_id,
      lease_period,
      client,
      stats: Mutex::new(RenewalStats {
        last_renewal: Utc::now(),
        last_latency: Duration::ZERO,
      }),
    }))
  }

  /// Extend the lease by its period.
  ///
  /// Transient server failures return `Ok(false)` so the caller can retry
  /// sooner. Any other failure means the lease is lost.
  pub async fn renew(&self, handle: &LeaseHandle) -> Result<bool, LeaseError> {
    let started = Instant::now();
    match handle.client.renew(&handle.lease_id).await {
      Ok(()) => {
        let mut stats = handle.stats.lock().await;
        stats.last_renewal = Utc::now();
        stats.last_latency = started.elapsed();
        Ok(true)
      }
      Err(e) if e.is_transient() => {
        warn!(
          lock_id = %handle.lock_id,
          error = %e,
          "transient failure renewing lease, will retry"
        );
        Ok(false)
      }
      Err(e) => {
        let stats = *handle.stats.lock().await;
        let since_last = Utc::now() - stats.last_renewal;
        error!(
          lock_id = %handle.lock_id,
          last_renewal = %stats.last_renewal,
          since_last_renewal_ms = since_last.num_milliseconds(),
          last_renewal_latency_ms = stats.last_latency.as_millis() as u64,
          lease_period_ms = handle.lease_period.as_millis() as u64,
          error = %e,
          "failed to renew lease"
        );
        Err(LeaseError::RenewalFailed {
          lock_id: handle.lock_id.clone(),
          source: e,
        })
      }
    }
  }

  /// Release the lease. A lease that already expired or was taken over is not
  /// an error.
  pub async fn release(&self, handle: &LeaseHandle) -> Result<(), LeaseError> {
    match handle.client.release(&handle.lease_id).await {
      Ok(()) => Ok(()),
      Err(e) if e.is_not_found() || e.is_conflict() => {
        debug!(lock_id = %handle.lock_id, error = %e, "lease already gone on release");
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  /// The owner recorded by the current holder, or `None` when the lock is
  /// not held. Owner metadata left behind by an expired holder is ignored.
  pub async fn lock_owner(&self, account: &str, lock_id: &str) -> Result<Option<String>, LeaseError> {
    let client = self.factory.client(account, lock_id)?;
    let Some(props) = client.properties().await? else {
      return Ok(None);
    };
    if props.lease_state == LeaseState::Available {
      return Ok(None);
    }
    Ok(props.metadata.get(OWNER_METADATA_KEY).cloned())
  }
}
