//! Canopy Config
//!
//! This crate contains the serializable host configuration types for Canopy.
//! These types describe the functions a host serves and the triggers bound to
//! them, before they are validated and resolved by `canopy-trigger`.
//!
//! Configuration is loaded from JSON files (via CLI with `canopy watch host.json`).
//! Durations are expressed as integer milliseconds (`*_ms` fields) and every
//! section has defaults, so a config only needs `host_id` and `functions`.

mod function;
mod host;

pub use function::{FunctionDef, SingletonDef, TriggerDef};
pub use host::{BlobListenerConfig, BlobStrategy, HostConfig, QueueConfig, SingletonConfig};
