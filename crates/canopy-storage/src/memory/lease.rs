use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::blob::LeaseState;
use crate::error::StorageError;
use crate::resource::BlobPath;

#[derive(Debug, Clone)]
struct Lease {
  id: String,
  duration: Duration,
  expires_at: Instant,
}

impl Lease {
  fn is_active(&self, now: Instant) -> bool {
    self.expires_at > now
  }
}

/// Blob lease bookkeeping shared by the in-process backends.
///
/// An expired lease keeps its id until someone else acquires the blob, so the
/// previous holder can still renew it.
#[derive(Debug, Default)]
pub(crate) struct LeaseTable {
  leases: HashMap<BlobPath, Lease>,
}

impl LeaseTable {
  pub(crate) fn state(&self, path: &BlobPath) -> LeaseState {
    match self.leases.get(path) {
      Some(lease) if lease.is_active(Instant::now()) => LeaseState::Leased,
      _ => LeaseState::Available,
    }
  }

  pub(crate) fn acquire(
    &mut self,
    path: &BlobPath,
    duration: Duration,
    proposed_lease_id: Option<&str>,
  ) -> Result<String, StorageError> {
    let now = Instant::now();
    if let Some(lease) = self.leases.get(path)
      && lease.is_active(now)
      && Some(lease.id.as_str()) != proposed_lease_id
    {
      return Err(StorageError::Conflict(format!("{path} is already leased")));
    }

    let id = proposed_lease_id
      .map(str::to_string)
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    self.leases.insert(
      path.clone(),
      Lease {
        id: id.clone(),
        duration,
        expires_at: now + duration,
      },
    );
    Ok(id)
  }

  pub(crate) fn renew(&mut self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError> {
    match self.leases.get_mut(path) {
      Some(lease) if lease.id == lease_id => {
        lease.expires_at = Instant::now() + lease.duration;
        Ok(())
      }
      _ => Err(StorageError::Conflict(format!(
        "lease {lease_id} on {path} was lost"
      ))),
    }
  }

  pub(crate) fn release(&mut self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError> {
    match self.leases.get(path) {
      Some(lease) if lease.id == lease_id => {
        self.leases.remove(path);
        Ok(())
      }
      _ => Err(StorageError::Conflict(format!(
        "lease {lease_id} on {path} is not held"
      ))),
    }
  }

  /// Writes to a leased blob must present the active lease id.
  pub(crate) fn check_write(
    &self,
    path: &BlobPath,
    lease_id: Option<&str>,
  ) -> Result<(), StorageError> {
    match self.leases.get(path) {
      Some(lease) if lease.is_active(Instant::now()) => {
        if Some(lease.id.as_str()) == lease_id {
          Ok(())
        } else {
          Err(StorageError::PreconditionFailed(format!("{path} is leased")))
        }
      }
      _ if lease_id.is_some() => Err(StorageError::PreconditionFailed(format!(
        "{path} has no active lease"
      ))),
      _ => Ok(()),
    }
  }
}
