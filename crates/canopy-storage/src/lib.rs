//! Canopy Storage
//!
//! This crate provides the storage collaborators the host coordinates through:
//! blob containers, queues and message-bus entities. Each concern is an async
//! trait ([`BlobStore`], [`QueueStore`], [`MessageBus`]) so listeners, locks and
//! causality tracking never depend on a concrete backend.
//!
//! Backends shipped here:
//! - [`MemoryBlobStore`], [`MemoryQueueStore`], [`MemoryMessageBus`] for tests and
//!   single-process hosts. Visibility and lease expiry use tokio time, so paused
//!   clocks drive them deterministically.
//! - [`FsBlobStore`] for local development, storing each container as a directory.
//!
//! Resource handles ([`ContainerRef`], [`QueueRef`], [`EntityRef`]) compare by
//! their canonical URI, so two handles built independently for the same
//! resource are equal and hash the same.

mod accounts;
mod blob;
mod bus;
mod error;
mod fs;
mod log;
mod memory;
mod queue;
mod resource;

pub use accounts::{StorageAccount, StorageAccounts};
pub use blob::{BlobItem, BlobProperties, BlobStore, ChangeLogBatch, LeaseState};
pub use bus::{BusMessage, MessageBus, ReceivedMessage};
pub use error::StorageError;
pub use fs::FsBlobStore;
pub use log::{BlobOperation, LogRow, ServiceType, format_log_line};
pub use memory::{MemoryBlobStore, MemoryMessageBus, MemoryQueueStore};
pub use queue::{QueueMessage, QueueStore};
pub use resource::{BlobPath, ContainerRef, EntityRef, QueueRef, ResourceIdentity};
