//! Resolves a host config into listeners and supervises their tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use canopy_causality::CausalityTracker;
use canopy_config::HostConfig;
use canopy_dispatch::{BlobHintSender, FunctionExecutor, InvocationDispatcher, blob_hint_channel};
use canopy_lease::{LeaseLockManager, SingletonManager, SingletonSettings};
use canopy_storage::{EntityRef, QueueRef, StorageAccounts};
use canopy_trigger::{FunctionDescriptor, TriggerKind, resolve_all};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob::{BlobChangeListener, BlobListenerSettings};
use crate::bus::BusPoller;
use crate::error::ListenerError;
use crate::queue::{QueueLeasePoller, QueueSettings};
use crate::timer::TimerListener;

const STANDBY_TASK: &str = "listener-lock";

/// Resolves a host config into listeners and owns their tasks.
///
/// With `singleton.listener_singleton` set, the host only runs its listeners
/// while it holds the `{host_id}/listener` lock. Other hosts with the same id
/// stay in standby and take over when the lock becomes free.
pub struct ListenerHost {
  inner: Arc<HostInner>,
  cancel: CancellationToken,
  tasks: Mutex<HostTasks>,
}

#[derive(Default)]
struct HostTasks {
  started: bool,
  active: HashMap<String, JoinHandle<()>>,
}

struct HostInner {
  host_id: String,
  instance_id: Uuid,
  dispatcher: InvocationDispatcher,
  hints: BlobHintSender,
  singletons: SingletonManager,
  listener_singleton: bool,
  listener_lock_period: Duration,
  standby_interval: Duration,
  functions: Vec<FunctionDescriptor>,
  blob: Option<Arc<Mutex<BlobChangeListener>>>,
  queues: Vec<Arc<QueueLeasePoller>>,
  buses: Vec<Arc<BusPoller>>,
  timers: Vec<Arc<TimerListener>>,
}

impl ListenerHost {
  /// Validate every function in `config` and build its listener. Fails if a
  /// trigger is invalid or names an account without the backend it needs.
  pub fn new(
    config: &HostConfig,
    accounts: StorageAccounts,
    executor: Arc<dyn FunctionExecutor>,
  ) -> Result<Self, ListenerError> {
    let triggers = resolve_all(&config.functions, accounts.default_name())?;

    let lock_account = config
      .singleton
      .lock_account
      .clone()
      .unwrap_or_else(|| accounts.default_name().to_string());
    let singletons = SingletonManager::new(
      LeaseLockManager::for_accounts(accounts.clone()),
      lock_account,
      &config.host_id,
      SingletonSettings::from(&config.singleton),
    );

    let (hints, hint_receiver) = blob_hint_channel();
    let dispatcher = InvocationDispatcher::new(executor, CausalityTracker::new(accounts.clone()))
      .with_singletons(singletons.clone())
      .with_blob_hints(hints.clone());

    let blob_triggers: Vec<_> = triggers
      .iter()
      .filter(|t| t.blob().is_some())
      .cloned()
      .collect();
    let blob = if blob_triggers.is_empty() {
      None
    } else {
      let listener = BlobChangeListener::new(
        &accounts,
        blob_triggers,
        dispatcher.clone(),
        &BlobListenerSettings::from(&config.blob),
      )?
      .with_hints(hint_receiver);
      Some(Arc::new(Mutex::new(listener)))
    };

    let mut queue_functions: Vec<(QueueRef, Vec<FunctionDescriptor>)> = Vec::new();
    let mut bus_functions: Vec<(EntityRef, Vec<FunctionDescriptor>)> = Vec::new();
    let mut timers = Vec::new();
    for trigger in &triggers {
      match &trigger.kind {
        TriggerKind::Queue(queue) => group(&mut queue_functions, queue, &trigger.function),
        TriggerKind::Bus(entity) => group(&mut bus_functions, entity, &trigger.function),
        TriggerKind::Timer(interval) => timers.push(Arc::new(TimerListener::new(
          trigger.function.clone(),
          *interval,
          dispatcher.clone(),
        ))),
        TriggerKind::Blob(_) => {}
      }
    }

    let queue_settings = QueueSettings::from(&config.queues);
    let mut queues = Vec::new();
    for (queue, functions) in queue_functions {
      let store = accounts.get(Some(queue.account()))?.queues()?;
      queues.push(Arc::new(QueueLeasePoller::new(
        queue,
        store,
        functions,
        dispatcher.clone(),
        queue_settings.clone(),
      )));
    }

    let mut buses = Vec::new();
    for (entity, functions) in bus_functions {
      let bus = accounts.get(Some(entity.account()))?.bus()?;
      buses.push(Arc::new(BusPoller::new(
        entity,
        bus,
        functions,
        dispatcher.clone(),
        &queue_settings,
      )));
    }

    let inner = HostInner {
      host_id: config.host_id.clone(),
      instance_id: Uuid::new_v4(),
      dispatcher,
      hints,
      singletons,
      listener_singleton: config.singleton.listener_singleton,
      listener_lock_period: config.singleton.listener_lock_period(),
      standby_interval: config.singleton.acquisition_polling_interval(),
      functions: triggers.into_iter().map(|t| t.function).collect(),
      blob,
      queues,
      buses,
      timers,
    };

    Ok(Self {
      inner: Arc::new(inner),
      cancel: CancellationToken::new(),
      tasks: Mutex::new(HostTasks::default()),
    })
  }

  pub fn dispatcher(&self) -> &InvocationDispatcher {
    &self.inner.dispatcher
  }

  /// Report blobs written outside of an invocation so the blob listener
  /// evaluates them before its next poll.
  pub fn blob_hints(&self) -> BlobHintSender {
    self.inner.hints.clone()
  }

  /// Spawn every listener, or the standby loop when listeners are guarded by
  /// the listener lock. A host starts once.
  pub async fn start(&self) -> Result<(), ListenerError> {
    let mut tasks = self.tasks.lock().await;
    if tasks.started {
      return Err(ListenerError::AlreadyStarted);
    }
    tasks.started = true;

    if self.inner.listener_singleton {
      let inner = self.inner.clone();
      let cancel = self.cancel.clone();
      let standby = tokio::spawn(async move { inner.run_standby(cancel).await });
      tasks.active.insert(STANDBY_TASK.to_string(), standby);
    } else {
      tasks.active.extend(self.inner.spawn_listeners(&self.cancel));
    }

    info!(
      host_id = %self.inner.host_id,
      instance_id = %self.inner.instance_id,
      tasks = tasks.active.len(),
      "host started"
    );
    Ok(())
  }

  /// Names of the tasks the host is running, sorted.
  pub async fn active_listeners(&self) -> Vec<String> {
    let tasks = self.tasks.lock().await;
    let mut names: Vec<String> = tasks.active.keys().cloned().collect();
    names.sort();
    names
  }

  /// Invoke a function by name outside of its trigger.
  pub fn invoke(&self, function: &str, parent_id: Option<Uuid>) -> Result<Uuid, ListenerError> {
    let descriptor = self
      .inner
      .functions
      .iter()
      .find(|f| f.name == function)
      .ok_or_else(|| ListenerError::UnknownFunction(function.to_string()))?;
    Ok(
      self
        .inner
        .dispatcher
        .dispatch_manual(descriptor, parent_id, &self.cancel),
    )
  }

  /// The instance currently holding the listener lock.
  pub async fn listener_lock_owner(&self) -> Result<Option<String>, ListenerError> {
    let lock_id = self.inner.singletons.listener_lock_id();
    Ok(self.inner.singletons.lock_owner(&lock_id).await?)
  }

  pub fn instance_id(&self) -> Uuid {
    self.inner.instance_id
  }

  /// Stop all listeners, then wait for in-flight invocations.
  pub async fn stop(&self) {
    self.cancel.cancel();
    let active: Vec<(String, JoinHandle<()>)> = {
      let mut tasks = self.tasks.lock().await;
      tasks.active.drain().collect()
    };
    join_all(active).await;
    self.inner.dispatcher.shutdown().await;
    info!(host_id = %self.inner.host_id, "host stopped");
  }
}

impl HostInner {
  fn spawn_listeners(&self, cancel: &CancellationToken) -> Vec<(String, JoinHandle<()>)> {
    let mut tasks = Vec::new();

    if let Some(blob) = &self.blob {
      let blob = blob.clone();
      let cancel = cancel.clone();
      let task = tokio::spawn(async move { blob.lock().await.run(&cancel).await });
      tasks.push(("blob".to_string(), task));
    }
    for poller in &self.queues {
      let poller = poller.clone();
      let name = poller.queue().to_string();
      let cancel = cancel.clone();
      tasks.push((name, tokio::spawn(async move { poller.run(cancel).await })));
    }
    for poller in &self.buses {
      let poller = poller.clone();
      let name = poller.entity().to_string();
      let cancel = cancel.clone();
      tasks.push((name, tokio::spawn(async move { poller.run(cancel).await })));
    }
    for timer in &self.timers {
      let timer = timer.clone();
      let name = format!("timer/{}", timer.function().name);
      let cancel = cancel.clone();
      tasks.push((name, tokio::spawn(async move { timer.run(cancel).await })));
    }

    tasks
  }

  /// Run listeners only while holding the listener lock; otherwise poll for it.
  async fn run_standby(&self, cancel: CancellationToken) {
    let lock_id = self.singletons.listener_lock_id();
    let owner = self.instance_id.to_string();

    loop {
      match self
        .singletons
        .try_lock(&lock_id, Some(owner.as_str()), self.listener_lock_period)
        .await
      {
        Ok(Some(lock)) => {
          info!(lock_id = %lock_id, "listener lock acquired, starting listeners");
          let listeners = cancel.child_token();
          let tasks = self.spawn_listeners(&listeners);
          let lost = lock.lost();

          tokio::select! {
            _ = cancel.cancelled() => {}
            _ = lost.cancelled() => {
              warn!(lock_id = %lock_id, "listener lock lost, stopping listeners");
            }
          }

          listeners.cancel();
          join_all(tasks).await;
          if let Err(e) = lock.release().await {
            warn!(lock_id = %lock_id, error = %e, "failed to release listener lock");
          }
        }
        Ok(None) => debug!(lock_id = %lock_id, "listener lock held by another host"),
        Err(e) => warn!(lock_id = %lock_id, error = %e, "failed to acquire listener lock"),
      }

      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(self.standby_interval) => {}
      }
    }
  }
}

fn group<K: PartialEq + Clone>(
  groups: &mut Vec<(K, Vec<FunctionDescriptor>)>,
  key: &K,
  function: &FunctionDescriptor,
) {
  match groups.iter_mut().find(|(k, _)| k == key) {
    Some((_, functions)) => functions.push(function.clone()),
    None => groups.push((key.clone(), vec![function.clone()])),
  }
}

async fn join_all(tasks: Vec<(String, JoinHandle<()>)>) {
  for (name, task) in tasks {
    if let Err(e) = task.await {
      warn!(listener = %name, error = %e, "listener task failed");
    }
  }
}
