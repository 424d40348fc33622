mod blob;
mod bus;
mod lease;
mod queue;

pub use blob::MemoryBlobStore;
pub use bus::MemoryMessageBus;
pub use queue::MemoryQueueStore;

pub(crate) use lease::LeaseTable;
