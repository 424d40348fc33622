//! Blob change detection.
//!
//! Each account is watched with one of two strategies: a full listing of the
//! registered containers every tick, or a cursor over the account's write log.
//! Both share a map of the last modified time already evaluated per blob, which
//! the hint path updates too, so a blob version is evaluated at most once.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use canopy_config::{BlobListenerConfig, BlobStrategy};
use canopy_dispatch::{BlobHint, BlobHintReceiver, InvocationDispatcher};
use canopy_storage::{BlobPath, BlobStore, ContainerRef, LogRow, StorageAccounts, StorageError};
use canopy_trigger::{BlobTrigger, TriggerDefinition, evaluate};
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ListenerError;

#[derive(Debug, Clone)]
pub struct BlobListenerSettings {
  pub poll_interval: Duration,
  pub strategy: BlobStrategy,
}

impl Default for BlobListenerSettings {
  fn default() -> Self {
    Self::from(&BlobListenerConfig::default())
  }
}

impl From<&BlobListenerConfig> for BlobListenerSettings {
  fn from(config: &BlobListenerConfig) -> Self {
    Self {
      poll_interval: config.poll_interval(),
      strategy: config.strategy,
    }
  }
}

/// Counters for one poll tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
  pub candidates: usize,
  pub dispatched: usize,
  pub failed: usize,
}

enum ScanState {
  /// Every registered container is listed each tick.
  FullScan,
  /// `cursor` is `None` until the first tick, which skips the existing log
  /// and lists the containers instead.
  ChangeLog {
    cursor: Option<u64>,
    retry: Vec<BlobPath>,
  },
}

struct AccountScan {
  account: String,
  store: Arc<dyn BlobStore>,
  containers: BTreeSet<String>,
  /// Last modified time of every blob already evaluated. A blob whose time is
  /// unchanged is not a candidate again.
  seen: HashMap<BlobPath, DateTime<Utc>>,
  state: ScanState,
}

/// Detects new and changed blobs in the containers named by blob triggers and
/// dispatches the triggers whose outputs are missing or stale.
pub struct BlobChangeListener {
  scans: Vec<AccountScan>,
  stores: HashMap<String, Arc<dyn BlobStore>>,
  triggers: Vec<TriggerDefinition>,
  dispatcher: InvocationDispatcher,
  poll_interval: Duration,
  hints: Option<BlobHintReceiver>,
}

impl BlobChangeListener {
  /// Non-blob triggers in `triggers` are ignored.
  pub fn new(
    accounts: &StorageAccounts,
    triggers: Vec<TriggerDefinition>,
    dispatcher: InvocationDispatcher,
    settings: &BlobListenerSettings,
  ) -> Result<Self, ListenerError> {
    let triggers: Vec<TriggerDefinition> =
      triggers.into_iter().filter(|t| t.blob().is_some()).collect();

    let mut containers: Vec<(String, BTreeSet<String>)> = Vec::new();
    for trigger in &triggers {
      let Some(blob) = trigger.blob() else {
        continue;
      };
      let name = blob.container.name().to_string();
      match containers.iter_mut().find(|(a, _)| *a == trigger.account) {
        Some((_, names)) => {
          names.insert(name);
        }
        None => containers.push((trigger.account.clone(), BTreeSet::from([name]))),
      }
    }

    let mut scans = Vec::new();
    let mut stores = HashMap::new();
    for (account, containers) in containers {
      let store = accounts.get(Some(account.as_str()))?.blobs()?;
      let state = match settings.strategy {
        BlobStrategy::FullScan => ScanState::FullScan,
        BlobStrategy::ChangeLog if store.supports_change_log() => change_log(),
        BlobStrategy::ChangeLog => {
          return Err(ListenerError::Config(format!(
            "account '{account}' does not provide a change log"
          )));
        }
        BlobStrategy::Auto if store.supports_change_log() => change_log(),
        BlobStrategy::Auto => ScanState::FullScan,
      };
      stores.insert(account.clone(), store.clone());
      scans.push(AccountScan {
        account,
        store,
        containers,
        seen: HashMap::new(),
        state,
      });
    }

    Ok(Self {
      scans,
      stores,
      triggers,
      dispatcher,
      poll_interval: settings.poll_interval,
      hints: None,
    })
  }

  /// Process blobs reported by completed invocations between ticks.
  pub fn with_hints(mut self, hints: BlobHintReceiver) -> Self {
    self.hints = Some(hints);
    self
  }

  /// The strategy in use for `account`, with `Auto` resolved.
  pub fn strategy(&self, account: &str) -> Option<BlobStrategy> {
    self
      .scans
      .iter()
      .find(|s| s.account == account)
      .map(|s| match s.state {
        ScanState::FullScan => BlobStrategy::FullScan,
        ScanState::ChangeLog { .. } => BlobStrategy::ChangeLog,
      })
  }

  /// Run until `cancel` fires. The first tick runs immediately.
  pub async fn run(&mut self, cancel: &CancellationToken) {
    info!(
      accounts = self.scans.len(),
      triggers = self.triggers.len(),
      "blob listener started"
    );

    let mut next_poll = Instant::now();
    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        hint = next_hint(&mut self.hints) => match hint {
          Some(hint) => {
            if let Err(e) = self.notify_blob_written(&hint.account, &hint.path, cancel).await {
              warn!(account = %hint.account, blob = %hint.path, error = %e, "failed to process blob hint");
            }
          }
          None => self.hints = None,
        },
        _ = tokio::time::sleep_until(next_poll) => {
          let summary = self.poll_once(cancel).await;
          debug!(
            candidates = summary.candidates,
            dispatched = summary.dispatched,
            failed = summary.failed,
            "blob poll finished"
          );
          next_poll = Instant::now() + self.poll_interval;
        }
      }
    }

    info!("blob listener stopped");
  }

  /// One pass over every account. Storage failures are logged and retried on
  /// a later tick.
  #[instrument(name = "blob.poll", skip_all)]
  pub async fn poll_once(&mut self, cancel: &CancellationToken) -> TickSummary {
    let mut summary = TickSummary::default();
    let mut scans = std::mem::take(&mut self.scans);

    for scan in &mut scans {
      if cancel.is_cancelled() {
        break;
      }
      let target = ScanTarget {
        account: &scan.account,
        store: &scan.store,
        containers: &scan.containers,
      };
      let seen = &mut scan.seen;
      match &mut scan.state {
        ScanState::FullScan => {
          self.scan_containers(target, seen, cancel, &mut summary).await;
        }
        ScanState::ChangeLog { cursor, retry } => {
          self
            .read_change_log(target, seen, cursor, retry, cancel, &mut summary)
            .await;
        }
      }
    }

    self.scans = scans;
    summary
  }

  /// Evaluate a blob that is known to have just been written. Returns the
  /// number of invocations dispatched.
  ///
  /// The evaluated version is recorded, so the next poll does not treat the
  /// same write as a new candidate.
  pub async fn notify_blob_written(
    &mut self,
    account: &str,
    path: &BlobPath,
    cancel: &CancellationToken,
  ) -> Result<usize, ListenerError> {
    let Some(index) = self.scans.iter().position(|s| s.account == account) else {
      return Ok(0);
    };
    let path = BlobPath::new(path.container.to_lowercase(), path.blob.clone());
    if !self.scans[index].containers.contains(&path.container) {
      return Ok(0);
    }

    let store = self.scans[index].store.clone();
    let Some(modified) = current_version(store.as_ref(), &path).await? else {
      debug!(account = %account, blob = %path, "blob no longer exists");
      return Ok(0);
    };
    if self.scans[index].seen.get(&path) == Some(&modified) {
      debug!(account = %account, blob = %path, "blob version already evaluated");
      return Ok(0);
    }

    let dispatched = self.process_candidate(account, &path, modified, cancel).await?;
    self.scans[index].seen.insert(path, modified);
    Ok(dispatched)
  }

  async fn scan_containers(
    &self,
    target: ScanTarget<'_>,
    seen: &mut HashMap<BlobPath, DateTime<Utc>>,
    cancel: &CancellationToken,
    summary: &mut TickSummary,
  ) {
    let mut current = HashMap::with_capacity(seen.len());

    for container in target.containers {
      let items = match target.store.list_blobs(container).await {
        Ok(items) => items,
        Err(e) if e.is_not_found() => {
          debug!(account = %target.account, container = %container, "container does not exist yet");
          continue;
        }
        Err(e) => {
          warn!(account = %target.account, container = %container, error = %e, "failed to list container");
          // Keep what was known so unchanged blobs are not reported as new.
          current.extend(
            seen
              .iter()
              .filter(|(path, _)| path.container == *container)
              .map(|(path, modified)| (path.clone(), *modified)),
          );
          continue;
        }
      };

      for item in items {
        if seen.get(&item.path) == Some(&item.last_modified) {
          current.insert(item.path, item.last_modified);
          continue;
        }

        summary.candidates += 1;
        match self
          .process_candidate(target.account, &item.path, item.last_modified, cancel)
          .await
        {
          Ok(dispatched) => {
            summary.dispatched += dispatched;
            current.insert(item.path, item.last_modified);
          }
          Err(e) => {
            summary.failed += 1;
            warn!(account = %target.account, blob = %item.path, error = %e, "failed to process blob");
            if !e.is_transient() {
              current.insert(item.path, item.last_modified);
            }
          }
        }
      }
    }

    *seen = current;
  }

  async fn read_change_log(
    &self,
    target: ScanTarget<'_>,
    seen: &mut HashMap<BlobPath, DateTime<Utc>>,
    cursor: &mut Option<u64>,
    retry: &mut Vec<BlobPath>,
    cancel: &CancellationToken,
    summary: &mut TickSummary,
  ) {
    let mut pending = std::mem::take(retry);

    match *cursor {
      None => {
        // Position at the end of the log first so writes racing the listing
        // are picked up from the log next tick.
        let batch = match target.store.read_change_log(0).await {
          Ok(batch) => batch,
          Err(e) => {
            warn!(account = %target.account, error = %e, "failed to read change log");
            *retry = pending;
            return;
          }
        };
        *cursor = Some(batch.cursor);

        for container in target.containers {
          match target.store.list_blobs(container).await {
            Ok(items) => {
              for item in items {
                push_unique(&mut pending, item.path);
              }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
              warn!(account = %target.account, container = %container, error = %e, "failed to list container");
            }
          }
        }
      }
      Some(position) => match target.store.read_change_log(position).await {
        Ok(batch) => {
          for line in &batch.lines {
            let Some(row) = LogRow::parse(line) else {
              continue;
            };
            if !row.operation.is_write() {
              continue;
            }
            let Some(path) = row.blob_path() else {
              continue;
            };
            if target.containers.contains(&path.container.to_lowercase()) {
              push_unique(&mut pending, path);
            }
          }
          *cursor = Some(batch.cursor);
        }
        Err(e) => {
          warn!(account = %target.account, error = %e, "failed to read change log");
        }
      },
    }

    for path in pending {
      if cancel.is_cancelled() {
        retry.push(path);
        continue;
      }
      let result = match current_version(target.store.as_ref(), &path).await {
        Ok(Some(modified)) if seen.get(&path) == Some(&modified) => continue,
        Ok(Some(modified)) => {
          summary.candidates += 1;
          self
            .process_candidate(target.account, &path, modified, cancel)
            .await
            .map(|dispatched| (dispatched, modified))
        }
        Ok(None) => {
          debug!(account = %target.account, blob = %path, "blob no longer exists");
          seen.remove(&path);
          continue;
        }
        Err(e) => {
          summary.candidates += 1;
          Err(e.into())
        }
      };

      match result {
        Ok((dispatched, modified)) => {
          summary.dispatched += dispatched;
          seen.insert(path, modified);
        }
        Err(e) => {
          summary.failed += 1;
          warn!(account = %target.account, blob = %path, error = %e, "failed to process blob");
          if e.is_transient() {
            retry.push(path);
          }
        }
      }
    }
  }

  /// Match the blob against every trigger on its container and dispatch the
  /// ones whose outputs need refreshing.
  async fn process_candidate(
    &self,
    account: &str,
    path: &BlobPath,
    input_modified: DateTime<Utc>,
    cancel: &CancellationToken,
  ) -> Result<usize, ListenerError> {
    let Some(store) = self.stores.get(account) else {
      return Ok(0);
    };
    let container = ContainerRef::new(account, &path.container);
    let matching: Vec<(&TriggerDefinition, &BlobTrigger)> = self
      .triggers
      .iter()
      .filter_map(|t| t.blob().filter(|b| b.container == container).map(|b| (t, b)))
      .collect();
    if matching.is_empty() {
      return Ok(0);
    }

    let mut dispatched = 0;
    for (trigger, blob) in matching {
      let Some(captures) = blob.input.matches_path(path) else {
        continue;
      };

      let freshness = evaluate(blob, &captures, input_modified, store.as_ref()).await?;
      if !freshness.should_invoke() {
        debug!(function = %trigger.function.name, blob = %path, "outputs are up to date");
        continue;
      }

      debug!(function = %trigger.function.name, blob = %path, freshness = ?freshness, "blob trigger fired");
      self
        .dispatcher
        .dispatch_blob(&trigger.function, account, path, captures, cancel)
        .await;
      dispatched += 1;
    }

    Ok(dispatched)
  }
}

#[derive(Clone, Copy)]
struct ScanTarget<'a> {
  account: &'a str,
  store: &'a Arc<dyn BlobStore>,
  containers: &'a BTreeSet<String>,
}

fn change_log() -> ScanState {
  ScanState::ChangeLog {
    cursor: None,
    retry: Vec::new(),
  }
}

async fn current_version(
  store: &dyn BlobStore,
  path: &BlobPath,
) -> Result<Option<DateTime<Utc>>, StorageError> {
  Ok(store.properties(path).await?.map(|p| p.last_modified))
}

fn push_unique(pending: &mut Vec<BlobPath>, path: BlobPath) {
  if !pending.contains(&path) {
    pending.push(path);
  }
}

async fn next_hint(hints: &mut Option<BlobHintReceiver>) -> Option<BlobHint> {
  match hints {
    Some(receiver) => receiver.recv().await,
    None => std::future::pending().await,
  }
}
