//! Canopy Dispatch
//!
//! Turns accepted trigger events into [`InvocationRequest`]s and hands them to
//! a [`FunctionExecutor`]. The dispatcher resolves parent lineage through the
//! causality tracker, guards singleton functions with a lease, and stamps the
//! blobs an invocation reports as written.
//!
//! Blob, timer and manual invocations are fire-and-forget
//! ([`InvocationDispatcher::dispatch`]); queue and bus invocations wait for the
//! result ([`InvocationDispatcher::invoke`]) so the caller can decide whether
//! to delete the message.

mod dispatcher;
mod error;
mod executor;
mod hint;
mod request;

pub use dispatcher::{InvocationDispatcher, InvocationResult};
pub use error::{DispatchError, ExecutorError};
pub use executor::{ChannelExecutor, FunctionExecutor, InvocationOutcome, WrittenBlob};
pub use hint::{BlobHint, BlobHintReceiver, BlobHintSender, blob_hint_channel};
pub use request::{InvocationRequest, TriggerReason};
