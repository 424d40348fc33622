//! Decides whether a blob trigger must run by comparing the input's last
//! modified time against its bound outputs.

use async_trait::async_trait;
use canopy_storage::{BlobPath, BlobStore, StorageError};
use chrono::{DateTime, Utc};

use crate::definition::BlobTrigger;
use crate::error::TriggerError;
use crate::pattern::Captures;

/// Resolves the last-modified time of a blob, `None` if it does not exist.
#[async_trait]
pub trait ModifiedTimeLookup: Send + Sync {
  async fn last_modified(&self, path: &BlobPath) -> Result<Option<DateTime<Utc>>, StorageError>;
}

#[async_trait]
impl ModifiedTimeLookup for dyn BlobStore {
  async fn last_modified(&self, path: &BlobPath) -> Result<Option<DateTime<Utc>>, StorageError> {
    Ok(self.properties(path).await?.map(|p| p.last_modified))
  }
}

/// Outcome of comparing a trigger's input with its declared outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
  /// The trigger declares no outputs, so every change is worth a run.
  NoOutputs,
  OutputMissing(BlobPath),
  /// The input is newer than this output.
  Stale(BlobPath),
  UpToDate,
}

impl Freshness {
  pub fn should_invoke(&self) -> bool {
    !matches!(self, Freshness::UpToDate)
  }
}

/// Compare the input's modification time against each output in declaration
/// order. The first missing or older output decides; all outputs must be at
/// least as new as the input for the trigger to be skipped.
pub async fn evaluate<L>(
  trigger: &BlobTrigger,
  captures: &Captures,
  input_modified: DateTime<Utc>,
  lookup: &L,
) -> Result<Freshness, TriggerError>
where
  L: ModifiedTimeLookup + ?Sized,
{
  if trigger.outputs.is_empty() {
    return Ok(Freshness::NoOutputs);
  }

  for output in &trigger.outputs {
    let path = output.apply(captures)?;
    match lookup.last_modified(&path).await? {
      None => return Ok(Freshness::OutputMissing(path)),
      Some(output_modified) if input_modified > output_modified => {
        return Ok(Freshness::Stale(path));
      }
      Some(_) => {}
    }
  }

  Ok(Freshness::UpToDate)
}

pub async fn should_invoke<L>(
  trigger: &BlobTrigger,
  captures: &Captures,
  input_modified: DateTime<Utc>,
  lookup: &L,
) -> Result<bool, TriggerError>
where
  L: ModifiedTimeLookup + ?Sized,
{
  Ok(
    evaluate(trigger, captures, input_modified, lookup)
      .await?
      .should_invoke(),
  )
}
