//! Lineage round trips through the in-memory backends.

use std::sync::Arc;

use bytes::Bytes;
use canopy_causality::{CausalityTracker, PARENT_ID_METADATA_KEY, Resource};
use canopy_storage::{
  BlobPath, BlobStore, BusMessage, EntityRef, MemoryBlobStore, MemoryMessageBus, MemoryQueueStore,
  MessageBus, QueueRef, QueueStore, StorageAccount, StorageAccounts,
};
use uuid::Uuid;

struct Fixture {
  tracker: CausalityTracker,
  blobs: MemoryBlobStore,
  queues: MemoryQueueStore,
  bus: MemoryMessageBus,
}

async fn fixture() -> Fixture {
  let blobs = MemoryBlobStore::new();
  let queues = MemoryQueueStore::new();
  let bus = MemoryMessageBus::new();
  blobs.create_container_if_not_exists("output").await.unwrap();
  queues.create_if_not_exists("orders").await.unwrap();

  let accounts = StorageAccounts::new(
    StorageAccount::new("main")
      .with_blobs(Arc::new(blobs.clone()))
      .with_queues(Arc::new(queues.clone()))
      .with_bus(Arc::new(bus.clone())),
  );
  Fixture {
    tracker: CausalityTracker::new(accounts),
    blobs,
    queues,
    bus,
  }
}

#[tokio::test]
async fn blob_written_with_lineage_reports_owner() {
  let f = fixture().await;
  let path = BlobPath::new("output", "report.json");
  let instance = Uuid::new_v4();

  f.tracker
    .write_blob("main", &path, Bytes::from_static(b"{}"), instance)
    .await
    .unwrap();

  let owner = f
    .tracker
    .owner(Resource::Blob {
      account: "main",
      path: &path,
    })
    .await;
  assert_eq!(owner, Some(instance));
  assert_eq!(f.blobs.download(&path).await.unwrap(), Bytes::from_static(b"{}"));
}

#[tokio::test]
async fn stamp_keeps_existing_metadata() {
  let f = fixture().await;
  let path = BlobPath::new("output", "a");
  f.blobs.upload(&path, Bytes::new(), true).await.unwrap();
  f.blobs
    .set_metadata(
      &path,
      [("team".to_string(), "data".to_string())].into(),
      None,
    )
    .await
    .unwrap();

  let instance = Uuid::new_v4();
  f.tracker.stamp_blob("main", &path, instance).await;

  let metadata = f.blobs.properties(&path).await.unwrap().unwrap().metadata;
  assert_eq!(metadata.get("team").map(String::as_str), Some("data"));
  assert_eq!(
    metadata.get(PARENT_ID_METADATA_KEY).cloned(),
    Some(instance.to_string())
  );
}

#[tokio::test]
async fn unstamped_and_missing_blobs_have_no_owner() {
  let f = fixture().await;
  let plain = BlobPath::new("output", "plain");
  f.blobs.upload(&plain, Bytes::new(), true).await.unwrap();

  let missing = BlobPath::new("output", "missing");
  for path in [&plain, &missing] {
    assert_eq!(
      f.tracker
        .owner(Resource::Blob {
          account: "main",
          path,
        })
        .await,
      None
    );
  }

  // Stamping a missing blob is swallowed.
  f.tracker.stamp_blob("main", &missing, Uuid::new_v4()).await;
  assert!(f.blobs.properties(&missing).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_account_has_no_owner() {
  let f = fixture().await;
  let path = BlobPath::new("output", "a");
  assert_eq!(
    f.tracker
      .owner(Resource::Blob {
        account: "elsewhere",
        path: &path,
      })
      .await,
    None
  );
}

#[tokio::test]
async fn queue_messages_carry_parent() {
  let f = fixture().await;
  let instance = Uuid::new_v4();

  f.tracker
    .enqueue(&QueueRef::new("main", "Orders"), r#"{"id":7}"#, instance)
    .await
    .unwrap();

  let message = f
    .queues
    .dequeue("orders", std::time::Duration::from_secs(30))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(
    f.tracker.owner(Resource::QueueMessage(&message)).await,
    Some(instance)
  );
}

#[tokio::test]
async fn bus_messages_carry_parent() {
  let f = fixture().await;
  let instance = Uuid::new_v4();

  f.tracker
    .send(&EntityRef::new("main", "events"), BusMessage::new("hello"), instance)
    .await
    .unwrap();

  let received = f
    .bus
    .receive("events", std::time::Duration::from_secs(30))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(received.message.body, "hello");
  assert_eq!(
    f.tracker.owner(Resource::BusMessage(&received.message)).await,
    Some(instance)
  );
  assert_eq!(
    f.tracker
      .owner(Resource::BusMessage(&BusMessage::new("plain")))
      .await,
    None
  );
}
