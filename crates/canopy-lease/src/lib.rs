//! Canopy Lease
//!
//! Cross-process mutual exclusion built on blob leases. Hosts share no memory,
//! so the only coordination point is the lease on a placeholder blob at
//! `locks/{lock_id}` in the host container.
//!
//! - [`LeaseLockManager`] acquires, renews, releases and inspects leases.
//!   Lease clients come from an injected [`LeaseClientFactory`].
//! - [`RenewalTimer`] runs a renewal callback on a schedule and stops when the
//!   protected work completes, is cancelled, or the timer is dropped.
//! - [`SingletonManager`] builds lock ids for singleton functions and listeners
//!   and waits for locks with a bounded acquisition timeout.

mod client;
mod error;
mod manager;
mod renewal;
mod singleton;

pub use client::{BlobLeaseClient, BlobLeaseClientFactory, LeaseClient, LeaseClientFactory};
pub use error::LeaseError;
pub use manager::{LOCK_CONTAINER, LeaseHandle, LeaseLockManager, OWNER_METADATA_KEY};
pub use renewal::{DelayStrategy, LinearSpeedupStrategy, RenewOutcome, RenewalTimer};
pub use singleton::{SingletonLock, SingletonManager, SingletonSettings, format_lock_id};
