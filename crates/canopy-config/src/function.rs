use serde::{Deserialize, Serialize};

/// A function served by the host, together with the trigger that invokes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
  /// Fully qualified function name (e.g., "Thumbnails.Resize").
  pub name: String,
  pub trigger: TriggerDef,
  /// When set, at most one invocation of this function runs across all hosts.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub singleton: Option<SingletonDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingletonDef {
  /// Narrows the lock to a scope, so different scopes run concurrently.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub scope: Option<String>,
}

/// Trigger definition as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDef {
  /// Fires when a blob matching `input` is written.
  Blob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    account: Option<String>,
    /// Path pattern, e.g. "input/{name}.csv".
    input: String,
    /// Output path patterns used for the staleness check.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    outputs: Vec<String>,
  },
  Queue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    account: Option<String>,
    queue_name: String,
  },
  /// Fires for messages on a topic subscription or a bus queue.
  Bus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    account: Option<String>,
    entity: String,
  },
  Timer { interval_ms: u64 },
}

impl TriggerDef {
  /// The storage account this trigger listens on, if it names one.
  pub fn account(&self) -> Option<&str> {
    match self {
      TriggerDef::Blob { account, .. }
      | TriggerDef::Queue { account, .. }
      | TriggerDef::Bus { account, .. } => account.as_deref(),
      TriggerDef::Timer { .. } => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_tagged_triggers() {
    let json = r#"[
      { "name": "A.Run", "trigger": { "type": "blob", "input": "in/{name}", "outputs": ["out/{name}"] } },
      { "name": "B.Run", "trigger": { "type": "queue", "queue_name": "orders", "account": "main" },
        "singleton": { "scope": "tenant" } },
      { "name": "C.Run", "trigger": { "type": "timer", "interval_ms": 60000 } }
    ]"#;

    let functions: Vec<FunctionDef> = serde_json::from_str(json).unwrap();
    assert_eq!(functions.len(), 3);
    assert!(matches!(
      &functions[0].trigger,
      TriggerDef::Blob { outputs, .. } if outputs == &vec!["out/{name}".to_string()]
    ));
    assert_eq!(functions[1].trigger.account(), Some("main"));
    assert_eq!(
      functions[1].singleton.as_ref().and_then(|s| s.scope.as_deref()),
      Some("tenant")
    );
    assert!(matches!(
      functions[2].trigger,
      TriggerDef::Timer { interval_ms: 60000 }
    ));
  }

  #[test]
  fn rejects_unknown_trigger_type() {
    let json = r#"{ "name": "A", "trigger": { "type": "http", "route": "/x" } }"#;
    assert!(serde_json::from_str::<FunctionDef>(json).is_err());
  }
}
