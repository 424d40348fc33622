use std::time::Duration;

use canopy_storage::{ContainerRef, EntityRef, QueueRef};
use serde::{Deserialize, Serialize};

use crate::pattern::PathPattern;

/// Identifies a function served by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionDescriptor {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub singleton: Option<Singleton>,
}

impl FunctionDescriptor {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      singleton: None,
    }
  }

  pub fn singleton(mut self, scope: Option<String>) -> Self {
    self.singleton = Some(Singleton { scope });
    self
  }
}

/// Marks a function as running at most once at a time across hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Singleton {
  pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BlobTrigger {
  pub container: ContainerRef,
  pub input: PathPattern,
  pub outputs: Vec<PathPattern>,
}

#[derive(Debug, Clone)]
pub enum TriggerKind {
  Blob(BlobTrigger),
  Queue(QueueRef),
  Bus(EntityRef),
  Timer(Duration),
}

impl TriggerKind {
  pub fn name(&self) -> &'static str {
    match self {
      TriggerKind::Blob(_) => "blob",
      TriggerKind::Queue(_) => "queue",
      TriggerKind::Bus(_) => "bus",
      TriggerKind::Timer(_) => "timer",
    }
  }
}

/// A function bound to the resource that triggers it. Immutable once resolved.
#[derive(Debug, Clone)]
pub struct TriggerDefinition {
  pub function: FunctionDescriptor,
  pub account: String,
  pub kind: TriggerKind,
}

impl TriggerDefinition {
  pub fn blob(&self) -> Option<&BlobTrigger> {
    match &self.kind {
      TriggerKind::Blob(trigger) => Some(trigger),
      _ => None,
    }
  }
}
