//! Blob change detection against in-memory stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use canopy_causality::CausalityTracker;
use canopy_config::{BlobStrategy, FunctionDef, TriggerDef};
use canopy_dispatch::{
  ExecutorError, FunctionExecutor, InvocationDispatcher, InvocationOutcome, InvocationRequest,
  TriggerReason, blob_hint_channel,
};
use canopy_listener::{BlobChangeListener, BlobListenerSettings, ListenerError};
use canopy_storage::{
  BlobItem, BlobPath, BlobProperties, BlobStore, ChangeLogBatch, MemoryBlobStore, StorageAccount,
  StorageAccounts, StorageError,
};
use canopy_trigger::{TriggerDefinition, resolve};
use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingExecutor {
  requests: Mutex<Vec<InvocationRequest>>,
}

impl RecordingExecutor {
  fn requests(&self) -> Vec<InvocationRequest> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl FunctionExecutor for RecordingExecutor {
  async fn execute(
    &self,
    request: InvocationRequest,
    _cancel: CancellationToken,
  ) -> Result<InvocationOutcome, ExecutorError> {
    self.requests.lock().unwrap().push(request);
    Ok(InvocationOutcome::default())
  }
}

/// Delegates to a memory store, failing reads with a 503 while `failing` is set.
struct FlakyStore {
  inner: MemoryBlobStore,
  failing: AtomicBool,
}

impl FlakyStore {
  fn unavailable() -> StorageError {
    StorageError::server(503, "server busy")
  }

  fn check(&self) -> Result<(), StorageError> {
    if self.failing.load(Ordering::SeqCst) {
      return Err(Self::unavailable());
    }
    Ok(())
  }
}

#[async_trait]
impl BlobStore for FlakyStore {
  async fn create_container_if_not_exists(&self, container: &str) -> Result<bool, StorageError> {
    self.inner.create_container_if_not_exists(container).await
  }

  async fn list_blobs(&self, container: &str) -> Result<Vec<BlobItem>, StorageError> {
    self.check()?;
    self.inner.list_blobs(container).await
  }

  async fn properties(&self, path: &BlobPath) -> Result<Option<BlobProperties>, StorageError> {
    self.check()?;
    self.inner.properties(path).await
  }

  async fn upload(&self, path: &BlobPath, data: Bytes, overwrite: bool) -> Result<(), StorageError> {
    self.inner.upload(path, data, overwrite).await
  }

  async fn download(&self, path: &BlobPath) -> Result<Bytes, StorageError> {
    self.inner.download(path).await
  }

  async fn set_metadata(
    &self,
    path: &BlobPath,
    metadata: HashMap<String, String>,
    lease_id: Option<&str>,
  ) -> Result<(), StorageError> {
    self.inner.set_metadata(path, metadata, lease_id).await
  }

  async fn acquire_lease(
    &self,
    path: &BlobPath,
    duration: Duration,
    proposed_lease_id: Option<&str>,
  ) -> Result<String, StorageError> {
    self.inner.acquire_lease(path, duration, proposed_lease_id).await
  }

  async fn renew_lease(&self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError> {
    self.inner.renew_lease(path, lease_id).await
  }

  async fn release_lease(&self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError> {
    self.inner.release_lease(path, lease_id).await
  }

  fn supports_change_log(&self) -> bool {
    self.inner.supports_change_log()
  }

  async fn read_change_log(&self, cursor: u64) -> Result<ChangeLogBatch, StorageError> {
    self.inner.read_change_log(cursor).await
  }
}

struct Fixture {
  accounts: StorageAccounts,
  executor: Arc<RecordingExecutor>,
  dispatcher: InvocationDispatcher,
}

fn fixture(store: Arc<dyn BlobStore>) -> Fixture {
  let accounts = StorageAccounts::new(StorageAccount::new("main").with_blobs(store));
  let executor = Arc::new(RecordingExecutor::default());
  let dispatcher = InvocationDispatcher::new(executor.clone(), CausalityTracker::new(accounts.clone()));
  Fixture {
    accounts,
    executor,
    dispatcher,
  }
}

fn csv_trigger(outputs: &[&str]) -> TriggerDefinition {
  let def = FunctionDef {
    name: "Csv.Convert".to_string(),
    trigger: TriggerDef::Blob {
      account: None,
      input: "input/{name}.csv".to_string(),
      outputs: outputs.iter().map(|o| o.to_string()).collect(),
    },
    singleton: None,
  };
  resolve(&def, "main").unwrap()
}

fn settings(strategy: BlobStrategy) -> BlobListenerSettings {
  BlobListenerSettings {
    poll_interval: Duration::from_secs(10),
    strategy,
  }
}

fn listener(f: &Fixture, trigger: TriggerDefinition, strategy: BlobStrategy) -> BlobChangeListener {
  BlobChangeListener::new(&f.accounts, vec![trigger], f.dispatcher.clone(), &settings(strategy)).unwrap()
}

async fn upload(store: &dyn BlobStore, path: &str) -> BlobPath {
  let path = BlobPath::parse(path).unwrap();
  store
    .upload(&path, Bytes::from_static(b"data"), true)
    .await
    .unwrap();
  path
}

fn blob_paths(requests: &[InvocationRequest]) -> Vec<String> {
  requests
    .iter()
    .filter_map(|r| match &r.reason {
      TriggerReason::Blob { path, .. } => Some(path.to_string()),
      _ => None,
    })
    .collect()
}

#[tokio::test]
async fn full_scan_dispatches_each_change_once() {
  let store = MemoryBlobStore::new();
  store.create_container_if_not_exists("input").await.unwrap();
  let f = fixture(Arc::new(store.clone()));
  let mut listener = listener(&f, csv_trigger(&[]), BlobStrategy::FullScan);
  let cancel = CancellationToken::new();

  upload(&store, "input/a.csv").await;
  upload(&store, "input/readme.txt").await;

  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.candidates, 2);
  assert_eq!(summary.dispatched, 1);

  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.candidates, 0);

  f.dispatcher.shutdown().await;
  let requests = f.executor.requests();
  assert_eq!(blob_paths(&requests), vec!["input/a.csv"]);
  match &requests[0].reason {
    TriggerReason::Blob { captures, .. } => assert_eq!(captures.get("name"), Some("a")),
    other => panic!("unexpected reason {other:?}"),
  }
}

#[tokio::test]
async fn full_scan_respects_output_freshness() {
  let store = MemoryBlobStore::new();
  store.create_container_if_not_exists("input").await.unwrap();
  store.create_container_if_not_exists("output").await.unwrap();
  let f = fixture(Arc::new(store.clone()));
  let mut listener = listener(&f, csv_trigger(&["output/{name}.json"]), BlobStrategy::FullScan);
  let cancel = CancellationToken::new();

  let input = upload(&store, "input/a.csv").await;
  upload(&store, "output/a.json").await;

  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.candidates, 1);
  assert_eq!(summary.dispatched, 0);

  store
    .set_last_modified(&input, Utc::now() + TimeDelta::hours(1))
    .await
    .unwrap();
  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.dispatched, 1);

  f.dispatcher.shutdown().await;
  assert_eq!(blob_paths(&f.executor.requests()), vec!["input/a.csv"]);
}

#[tokio::test]
async fn missing_container_is_skipped_until_created() {
  let store = MemoryBlobStore::new();
  let f = fixture(Arc::new(store.clone()));
  let mut listener = listener(&f, csv_trigger(&[]), BlobStrategy::FullScan);
  let cancel = CancellationToken::new();

  assert_eq!(listener.poll_once(&cancel).await, Default::default());

  store.create_container_if_not_exists("input").await.unwrap();
  upload(&store, "input/late.csv").await;
  assert_eq!(listener.poll_once(&cancel).await.dispatched, 1);
}

#[tokio::test]
async fn strategy_follows_change_log_support() {
  let plain = fixture(Arc::new(MemoryBlobStore::new()));
  let logged = fixture(Arc::new(MemoryBlobStore::with_change_log("main")));

  let auto_plain = listener(&plain, csv_trigger(&[]), BlobStrategy::Auto);
  assert_eq!(auto_plain.strategy("main"), Some(BlobStrategy::FullScan));

  let auto_logged = listener(&logged, csv_trigger(&[]), BlobStrategy::Auto);
  assert_eq!(auto_logged.strategy("main"), Some(BlobStrategy::ChangeLog));

  let forced = listener(&logged, csv_trigger(&[]), BlobStrategy::FullScan);
  assert_eq!(forced.strategy("main"), Some(BlobStrategy::FullScan));

  let result = BlobChangeListener::new(
    &plain.accounts,
    vec![csv_trigger(&[])],
    plain.dispatcher.clone(),
    &settings(BlobStrategy::ChangeLog),
  );
  assert!(matches!(result, Err(ListenerError::Config(_))));
}

#[tokio::test]
async fn change_log_lists_once_then_follows_the_log() {
  let store = MemoryBlobStore::with_change_log("main");
  store.create_container_if_not_exists("input").await.unwrap();
  store.create_container_if_not_exists("other").await.unwrap();
  let f = fixture(Arc::new(store.clone()));
  let mut listener = listener(&f, csv_trigger(&[]), BlobStrategy::ChangeLog);
  let cancel = CancellationToken::new();

  upload(&store, "input/existing.csv").await;
  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.dispatched, 1);

  // Nothing new in the log.
  assert_eq!(listener.poll_once(&cancel).await.candidates, 0);

  upload(&store, "input/new.csv").await;
  upload(&store, "other/ignored.csv").await;
  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.candidates, 1);
  assert_eq!(summary.dispatched, 1);

  f.dispatcher.shutdown().await;
  assert_eq!(
    blob_paths(&f.executor.requests()),
    vec!["input/existing.csv", "input/new.csv"]
  );
}

#[tokio::test]
async fn change_log_retries_transient_failures_next_tick() {
  let store = Arc::new(FlakyStore {
    inner: MemoryBlobStore::with_change_log("main"),
    failing: AtomicBool::new(false),
  });
  store.create_container_if_not_exists("input").await.unwrap();
  let f = fixture(store.clone());
  let mut listener = listener(&f, csv_trigger(&[]), BlobStrategy::Auto);
  let cancel = CancellationToken::new();

  assert_eq!(listener.poll_once(&cancel).await.candidates, 0);

  upload(store.as_ref(), "input/a.csv").await;
  store.failing.store(true, Ordering::SeqCst);
  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.failed, 1);
  assert_eq!(summary.dispatched, 0);

  store.failing.store(false, Ordering::SeqCst);
  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.dispatched, 1);
}

#[tokio::test]
async fn full_scan_survives_listing_failures() {
  let store = Arc::new(FlakyStore {
    inner: MemoryBlobStore::new(),
    failing: AtomicBool::new(true),
  });
  store.create_container_if_not_exists("input").await.unwrap();
  upload(store.as_ref(), "input/a.csv").await;
  let f = fixture(store.clone());
  let mut listener = listener(&f, csv_trigger(&[]), BlobStrategy::FullScan);
  let cancel = CancellationToken::new();

  assert_eq!(listener.poll_once(&cancel).await, Default::default());

  store.failing.store(false, Ordering::SeqCst);
  assert_eq!(listener.poll_once(&cancel).await.dispatched, 1);
}

#[tokio::test]
async fn notify_evaluates_a_single_blob() {
  let store = MemoryBlobStore::new();
  store.create_container_if_not_exists("input").await.unwrap();
  let f = fixture(Arc::new(store.clone()));
  let mut listener = listener(&f, csv_trigger(&[]), BlobStrategy::FullScan);
  let cancel = CancellationToken::new();

  let written = upload(&store, "input/hinted.csv").await;
  assert_eq!(listener.notify_blob_written("main", &written, &cancel).await.unwrap(), 1);

  let missing = BlobPath::new("input", "gone.csv");
  assert_eq!(listener.notify_blob_written("main", &missing, &cancel).await.unwrap(), 0);

  let unwatched = BlobPath::new("elsewhere", "x.csv");
  assert_eq!(listener.notify_blob_written("main", &unwatched, &cancel).await.unwrap(), 0);
}

#[tokio::test]
async fn full_scan_skips_a_blob_version_already_hinted() {
  let store = MemoryBlobStore::new();
  store.create_container_if_not_exists("input").await.unwrap();
  let f = fixture(Arc::new(store.clone()));
  let mut listener = listener(&f, csv_trigger(&[]), BlobStrategy::FullScan);
  let cancel = CancellationToken::new();

  assert_eq!(listener.poll_once(&cancel).await.candidates, 0);

  let written = upload(&store, "input/a.csv").await;
  assert_eq!(listener.notify_blob_written("main", &written, &cancel).await.unwrap(), 1);
  // A repeated hint for the same write is a no-op too.
  assert_eq!(listener.notify_blob_written("main", &written, &cancel).await.unwrap(), 0);

  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.candidates, 0);
  assert_eq!(summary.dispatched, 0);

  // A later write is a new version.
  store
    .set_last_modified(&written, Utc::now() + TimeDelta::hours(1))
    .await
    .unwrap();
  assert_eq!(listener.poll_once(&cancel).await.dispatched, 1);

  f.dispatcher.shutdown().await;
  assert_eq!(
    blob_paths(&f.executor.requests()),
    vec!["input/a.csv", "input/a.csv"]
  );
}

#[tokio::test]
async fn change_log_skips_rows_already_handled_by_a_hint() {
  let store = MemoryBlobStore::with_change_log("main");
  store.create_container_if_not_exists("input").await.unwrap();
  let f = fixture(Arc::new(store.clone()));
  let mut listener = listener(&f, csv_trigger(&[]), BlobStrategy::ChangeLog);
  let cancel = CancellationToken::new();

  assert_eq!(listener.poll_once(&cancel).await.candidates, 0);

  let hinted = upload(&store, "input/hinted.csv").await;
  assert_eq!(listener.notify_blob_written("main", &hinted, &cancel).await.unwrap(), 1);
  upload(&store, "input/logged.csv").await;

  let summary = listener.poll_once(&cancel).await;
  assert_eq!(summary.candidates, 1);
  assert_eq!(summary.dispatched, 1);

  f.dispatcher.shutdown().await;
  assert_eq!(
    blob_paths(&f.executor.requests()),
    vec!["input/hinted.csv", "input/logged.csv"]
  );
}

#[tokio::test(start_paused = true)]
async fn run_loop_picks_up_hints_between_polls() {
  let store = MemoryBlobStore::new();
  store.create_container_if_not_exists("input").await.unwrap();
  let f = fixture(Arc::new(store.clone()));
  let (hints, receiver) = blob_hint_channel();
  let mut listener = BlobChangeListener::new(
    &f.accounts,
    vec![csv_trigger(&[])],
    f.dispatcher.clone(),
    &BlobListenerSettings {
      poll_interval: Duration::from_secs(3600),
      strategy: BlobStrategy::FullScan,
    },
  )
  .unwrap()
  .with_hints(receiver);

  let cancel = CancellationToken::new();
  let task_cancel = cancel.clone();
  let task = tokio::spawn(async move { listener.run(&task_cancel).await });

  tokio::time::sleep(Duration::from_millis(10)).await;
  let written = upload(&store, "input/fresh.csv").await;
  hints.send("main", written);
  tokio::time::sleep(Duration::from_millis(10)).await;

  cancel.cancel();
  task.await.unwrap();
  f.dispatcher.shutdown().await;
  assert_eq!(blob_paths(&f.executor.requests()), vec!["input/fresh.csv"]);
}
