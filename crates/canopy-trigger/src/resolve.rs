use std::time::Duration;

use canopy_config::{FunctionDef, TriggerDef};
use canopy_storage::{ContainerRef, EntityRef, QueueRef};

use crate::definition::{BlobTrigger, FunctionDescriptor, Singleton, TriggerDefinition, TriggerKind};
use crate::error::TriggerError;
use crate::pattern::PathPattern;

const MIN_TIMER_INTERVAL: Duration = Duration::from_secs(60);

/// Validate a configured function and resolve its trigger.
///
/// Triggers that name no account are bound to `default_account`.
pub fn resolve(def: &FunctionDef, default_account: &str) -> Result<TriggerDefinition, TriggerError> {
  let function = FunctionDescriptor {
    name: def.name.clone(),
    singleton: def.singleton.as_ref().map(|s| Singleton {
      scope: s.scope.clone(),
    }),
  };
  if function.name.trim().is_empty() {
    return Err(TriggerError::invalid(&def.name, "function name is empty"));
  }

  let account = def
    .trigger
    .account()
    .unwrap_or(default_account)
    .to_string();

  let kind = match &def.trigger {
    TriggerDef::Blob { input, outputs, .. } => {
      TriggerKind::Blob(resolve_blob(&def.name, &account, input, outputs)?)
    }
    TriggerDef::Queue { queue_name, .. } => {
      let name = queue_name.to_lowercase();
      validate_queue_name(&name).map_err(|message| TriggerError::invalid(&def.name, message))?;
      TriggerKind::Queue(QueueRef::new(account.clone(), name))
    }
    TriggerDef::Bus { entity, .. } => {
      if entity.trim().is_empty() {
        return Err(TriggerError::invalid(&def.name, "bus entity is empty"));
      }
      TriggerKind::Bus(EntityRef::new(account.clone(), entity))
    }
    TriggerDef::Timer { interval_ms } => {
      let interval = Duration::from_millis(*interval_ms);
      if interval < MIN_TIMER_INTERVAL {
        return Err(TriggerError::invalid(
          &def.name,
          "timer interval must be at least one minute",
        ));
      }
      TriggerKind::Timer(interval)
    }
  };

  Ok(TriggerDefinition {
    function,
    account,
    kind,
  })
}

/// Resolve every function, failing on the first invalid one.
pub fn resolve_all(
  defs: &[FunctionDef],
  default_account: &str,
) -> Result<Vec<TriggerDefinition>, TriggerError> {
  defs.iter().map(|def| resolve(def, default_account)).collect()
}

fn resolve_blob(
  function: &str,
  account: &str,
  input: &str,
  outputs: &[String],
) -> Result<BlobTrigger, TriggerError> {
  let input_pattern = PathPattern::parse(input)?;
  let container = input_pattern
    .container()
    .ok_or_else(|| TriggerError::invalid(function, "blob input container must be literal"))?;
  let bound = input_pattern.parameter_names();

  let mut output_patterns = Vec::with_capacity(outputs.len());
  for output in outputs {
    if output.eq_ignore_ascii_case(input) {
      return Err(TriggerError::invalid(
        function,
        format!("output '{output}' is the same as the input"),
      ));
    }
    let pattern = PathPattern::parse(output)?;
    if let Some(name) = pattern
      .parameter_names()
      .into_iter()
      .find(|name| !bound.contains(name))
    {
      return Err(TriggerError::invalid(
        function,
        format!("output '{output}' uses '{{{name}}}' which the input does not capture"),
      ));
    }
    output_patterns.push(pattern);
  }

  Ok(BlobTrigger {
    container: ContainerRef::new(account, container),
    input: input_pattern,
    outputs: output_patterns,
  })
}

/// Queue names are 3-63 characters of lowercase letters, digits and single
/// dashes, and cannot start or end with a dash.
pub fn validate_queue_name(name: &str) -> Result<(), String> {
  if !(3..=63).contains(&name.len()) {
    return Err(format!("queue name '{name}' must be 3-63 characters"));
  }
  if !name
    .chars()
    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
  {
    return Err(format!(
      "queue name '{name}' may only contain lowercase letters, digits and dashes"
    ));
  }
  if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
    return Err(format!(
      "queue name '{name}' cannot start or end with a dash or contain consecutive dashes"
    ));
  }
  Ok(())
}
