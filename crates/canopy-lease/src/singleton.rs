//! Singleton locks for functions and listeners, built on renewed blob leases.

use std::sync::Arc;
use std::time::Duration;

use canopy_config::SingletonConfig;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::LeaseError;
use crate::manager::{LeaseHandle, LeaseLockManager};
use crate::renewal::{LinearSpeedupStrategy, RenewOutcome, RenewalTimer};

#[derive(Debug, Clone)]
pub struct SingletonSettings {
  pub lock_period: Duration,
  pub listener_lock_period: Duration,
  pub acquisition_timeout: Duration,
  pub acquisition_polling_interval: Duration,
  pub min_renewal_interval: Duration,
}

impl Default for SingletonSettings {
  fn default() -> Self {
    Self::from(&SingletonConfig::default())
  }
}

impl From<&SingletonConfig> for SingletonSettings {
  fn from(config: &SingletonConfig) -> Self {
    Self {
      lock_period: config.lock_period(),
      listener_lock_period: config.listener_lock_period(),
      acquisition_timeout: config.acquisition_timeout(),
      acquisition_polling_interval: config.acquisition_polling_interval(),
      min_renewal_interval: config.min_renewal_interval(),
    }
  }
}

/// Lock id for a singleton function: `{host_id}/{function}[.{scope}]`.
pub fn format_lock_id(host_id: &str, function: &str, scope: Option<&str>) -> String {
  match scope.filter(|s| !s.is_empty()) {
    Some(scope) => format!("{host_id}/{function}.{scope}"),
    None => format!("{host_id}/{function}"),
  }
}

/// Singleton locks for functions and listeners on one account.
#[derive(Clone)]
pub struct SingletonManager {
  locks: LeaseLockManager,
  account: String,
  host_id: String,
  settings: SingletonSettings,
}

impl SingletonManager {
  pub fn new(
    locks: LeaseLockManager,
    account: impl Into<String>,
    host_id: impl Into<String>,
    settings: SingletonSettings,
  ) -> Self {
    Self {
      locks,
      account: account.into(),
      host_id: host_id.into(),
      settings,
    }
  }

  pub fn settings(&self) -> &SingletonSettings {
    &self.settings
  }

  pub fn function_lock_id(&self, function: &str, scope: Option<&str>) -> String {
    format_lock_id(&self.host_id, function, scope)
  }

  pub fn listener_lock_id(&self) -> String {
    format!("{}/listener", self.host_id)
  }

  /// Take the lock if it is free and start renewing it at half the lease
  /// period. Renewal runs until the lock is released or dropped, so the lease
  /// is held for as long as its holder is still working.
  pub async fn try_lock(
    &self,
    lock_id: &str,
    owner_id: Option<&str>,
    period: Duration,
  ) -> Result<Option<SingletonLock>, LeaseError> {
    let Some(handle) = self
      .locks
      .try_lock(&self.account, lock_id, owner_id, None, period)
      .await?
    else {
      return Ok(None);
    };
    let handle = Arc::new(handle);

    let strategy = LinearSpeedupStrategy::new(period / 2, self.settings.min_renewal_interval);
    let locks = self.locks.clone();
    let renew_handle = handle.clone();
    let unbound = CancellationToken::new();
    let timer = RenewalTimer::start(&unbound, strategy.normal(), strategy, move || {
      let locks = locks.clone();
      let handle = renew_handle.clone();
      async move {
        match locks.renew(&handle).await {
          Ok(true) => RenewOutcome::Renewed,
          Ok(false) => RenewOutcome::Retry,
          Err(_) => RenewOutcome::Lost,
        }
      }
    });

    info!(lock_id = %lock_id, "singleton lock acquired");
    Ok(Some(SingletonLock {
      handle,
      locks: self.locks.clone(),
      timer: Some(timer),
    }))
  }

  /// Poll for the lock until it is acquired or the acquisition timeout passes.
  /// `cancel` only stops the polling; a lock already returned is unaffected.
  pub async fn lock(
    &self,
    lock_id: &str,
    owner_id: Option<&str>,
    period: Duration,
    cancel: &CancellationToken,
  ) -> Result<SingletonLock, LeaseError> {
    let deadline = Instant::now() + self.settings.acquisition_timeout;
    loop {
      if let Some(lock) = self.try_lock(lock_id, owner_id, period).await? {
        return Ok(lock);
      }

      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return Err(LeaseError::AcquisitionTimeout {
          lock_id: lock_id.to_string(),
          timeout: self.settings.acquisition_timeout,
        });
      }

      tokio::select! {
        _ = cancel.cancelled() => return Err(LeaseError::Cancelled),
        _ = tokio::time::sleep(self.settings.acquisition_polling_interval.min(remaining)) => {}
      }
    }
  }

  pub async fn lock_owner(&self, lock_id: &str) -> Result<Option<String>, LeaseError> {
    self.locks.lock_owner(&self.account, lock_id).await
  }
}

/// A held singleton lock with its renewal task.
///
/// Dropping the lock without calling [`SingletonLock::release`] stops renewal
/// and releases the lease in the background.
pub struct SingletonLock {
  handle: Arc<LeaseHandle>,
  locks: LeaseLockManager,
  timer: Option<RenewalTimer>,
}

impl SingletonLock {
  pub fn lock_id(&self) -> &str {
    self.handle.lock_id()
  }

  /// Fires when the lease could not be renewed.
  pub fn lost(&self) -> CancellationToken {
    match &self.timer {
      Some(timer) => timer.lost(),
      None => CancellationToken::new(),
    }
  }

  pub fn is_lost(&self) -> bool {
    self.timer.as_ref().is_some_and(RenewalTimer::is_lost)
  }

  pub async fn release(mut self) -> Result<(), LeaseError> {
    if let Some(timer) = self.timer.take() {
      timer.stop().await;
    }
    self.locks.release(&self.handle).await
  }
}

impl Drop for SingletonLock {
  fn drop(&mut self) {
    let Some(timer) = self.timer.take() else {
      return;
    };
    drop(timer);

    let locks = self.locks.clone();
    let handle = self.handle.clone();
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
      runtime.spawn(async move {
        if let Err(e) = locks.release(&handle).await {
          warn!(lock_id = %handle.lock_id(), error = %e, "failed to release dropped lock");
        }
      });
    }
  }
}
