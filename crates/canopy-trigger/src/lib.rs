//! Canopy Trigger
//!
//! Resolved trigger definitions and the decisions made about them:
//!
//! - [`PathPattern`] matches blob paths such as `input/{name}.csv` and
//!   substitutes captured names into output patterns.
//! - [`TriggerDefinition`] binds a function to one [`TriggerKind`], validated
//!   from the config crate's `FunctionDef` by [`resolve`].
//! - [`should_invoke`] decides whether a blob trigger's outputs are stale
//!   relative to its input.

mod definition;
mod error;
mod pattern;
mod resolve;
mod staleness;

pub use definition::{BlobTrigger, FunctionDescriptor, Singleton, TriggerDefinition, TriggerKind};
pub use error::{PatternError, TriggerError};
pub use pattern::{Captures, PathPattern};
pub use resolve::{resolve, resolve_all, validate_queue_name};
pub use staleness::{Freshness, ModifiedTimeLookup, evaluate, should_invoke};
