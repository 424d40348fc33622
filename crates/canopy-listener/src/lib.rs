//! Canopy Listener
//!
//! Polling loops that turn storage changes into invocations:
//!
//! - [`BlobChangeListener`] discovers new and changed blobs, either by listing
//!   every registered container each tick or by reading the account's storage
//!   write log, and runs each candidate through pattern matching and the
//!   staleness check before dispatching.
//! - [`QueueLeasePoller`] dequeues one message at a time, keeps it invisible
//!   while its functions run, and deletes it only when every function
//!   succeeded.
//! - [`BusPoller`] and [`TimerListener`] cover message-bus and timer triggers.
//! - [`ListenerHost`] resolves a host config into listeners and owns their
//!   tasks, optionally running them only while holding the listener lock.

mod backoff;
mod blob;
mod bus;
mod error;
mod host;
mod queue;
mod timer;

pub use backoff::Backoff;
pub use blob::{BlobChangeListener, BlobListenerSettings, TickSummary};
pub use bus::BusPoller;
pub use error::ListenerError;
pub use host::ListenerHost;
pub use queue::{MessageState, PollOutcome, QueueLeasePoller, QueueSettings, poison_queue_name};
pub use timer::TimerListener;
