//! Canopy Causality
//!
//! Records which function instance produced a resource, so an invocation
//! triggered by that resource can name its parent. The lineage lives on the
//! resource itself:
//!
//! - blobs carry a [`PARENT_ID_METADATA_KEY`] metadata entry, written after
//!   the content so a reader never sees lineage for content that is not there;
//! - queue messages with JSON object payloads carry a [`PARENT_ID_FIELD`] field;
//! - bus messages carry a [`PARENT_ID_FIELD`] property.
//!
//! Lineage is best-effort. Failures to write or read it are logged and never
//! fail the surrounding operation.

mod tracker;

pub use tracker::{CausalityTracker, PARENT_ID_FIELD, PARENT_ID_METADATA_KEY, Resource};
