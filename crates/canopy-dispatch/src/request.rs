use std::collections::HashMap;

use canopy_storage::BlobPath;
use canopy_trigger::{Captures, FunctionDescriptor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Why a function is being invoked.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerReason {
  Blob {
    account: String,
    path: BlobPath,
    captures: Captures,
  },
  Queue {
    account: String,
    queue: String,
    message_id: String,
    dequeue_count: u32,
    body: String,
  },
  Bus {
    account: String,
    entity: String,
    delivery_count: u32,
    body: String,
    properties: HashMap<String, String>,
  },
  Timer {
    interval_ms: u64,
  },
  Manual,
}

impl TriggerReason {
  pub fn description(&self) -> String {
    match self {
      TriggerReason::Blob { path, .. } => format!("New blob detected: {path}"),
      TriggerReason::Queue { queue, .. } => format!("New queue message detected on '{queue}'."),
      TriggerReason::Bus { entity, .. } => format!("New bus message detected on '{entity}'."),
      TriggerReason::Timer { interval_ms } => format!("Timer fired after {interval_ms}ms."),
      TriggerReason::Manual => "This function was programmatically called via the host APIs.".to_string(),
    }
  }
}

/// A request to run one function instance.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRequest {
  pub instance_id: Uuid,
  pub function: FunctionDescriptor,
  pub reason: TriggerReason,
  /// Instance that produced the triggering resource, when known.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parent_id: Option<Uuid>,
  pub requested_at: DateTime<Utc>,
}

impl InvocationRequest {
  pub fn new(function: FunctionDescriptor, reason: TriggerReason, parent_id: Option<Uuid>) -> Self {
    Self {
      instance_id: Uuid::new_v4(),
      function,
      reason,
      parent_id,
      requested_at: Utc::now(),
    }
  }
}
