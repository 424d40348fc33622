//! Storage write-log parsing.
//!
//! Log lines use the storage analytics format version 1.0: `;`-separated
//! fields, where fields containing separators are wrapped in double quotes.

use chrono::{DateTime, Utc};

use crate::resource::BlobPath;

const LOG_VERSION: &str = "1.0";
const FIELD_COUNT: usize = 30;

const REQUEST_START_TIME: usize = 1;
const OPERATION_TYPE: usize = 2;
const SERVICE_TYPE: usize = 10;
const REQUESTED_OBJECT_KEY: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
  Blob,
  Queue,
  Table,
}

impl ServiceType {
  fn parse(value: &str) -> Option<Self> {
    match value {
      "blob" => Some(ServiceType::Blob),
      "queue" => Some(ServiceType::Queue),
      "table" => Some(ServiceType::Table),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobOperation {
  PutBlob,
  CopyBlob,
  CopyBlobSource,
  CopyBlobDestination,
  SetBlobMetadata,
  SetBlobProperties,
  DeleteBlob,
  GetBlob,
  Other(String),
}

impl BlobOperation {
  pub fn parse(value: &str) -> Self {
    match value {
      "PutBlob" => BlobOperation::PutBlob,
      "CopyBlob" => BlobOperation::CopyBlob,
      "CopyBlobSource" => BlobOperation::CopyBlobSource,
      "CopyBlobDestination" => BlobOperation::CopyBlobDestination,
      "SetBlobMetadata" => BlobOperation::SetBlobMetadata,
      "SetBlobProperties" => BlobOperation::SetBlobProperties,
      "DeleteBlob" => BlobOperation::DeleteBlob,
      "GetBlob" => BlobOperation::GetBlob,
      other => BlobOperation::Other(other.to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      BlobOperation::PutBlob => "PutBlob",
      BlobOperation::CopyBlob => "CopyBlob",
      BlobOperation::CopyBlobSource => "CopyBlobSource",
      BlobOperation::CopyBlobDestination => "CopyBlobDestination",
      BlobOperation::SetBlobMetadata => "SetBlobMetadata",
      BlobOperation::SetBlobProperties => "SetBlobProperties",
      BlobOperation::DeleteBlob => "DeleteBlob",
      BlobOperation::GetBlob => "GetBlob",
      BlobOperation::Other(name) => name,
    }
  }

  /// Operations that change blob content or metadata.
  pub fn is_write(&self) -> bool {
    matches!(
      self,
      BlobOperation::PutBlob
        | BlobOperation::CopyBlob
        | BlobOperation::CopyBlobSource
        | BlobOperation::CopyBlobDestination
        | BlobOperation::SetBlobMetadata
        | BlobOperation::SetBlobProperties
    )
  }
}

/// One parsed log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
  pub request_start_time: DateTime<Utc>,
  pub operation: BlobOperation,
  pub service: ServiceType,
  /// Raw requested object key, e.g. `/account/container/blob`.
  pub object_key: String,
}

impl LogRow {
  /// Parse a single log line. Returns `None` for other log versions and
  /// malformed lines.
  pub fn parse(line: &str) -> Option<Self> {
    let fields = split_fields(line.trim_end());
    if fields.len() <= REQUESTED_OBJECT_KEY || fields[0] != LOG_VERSION {
      return None;
    }

    let request_start_time = DateTime::parse_from_rfc3339(&fields[REQUEST_START_TIME])
      .ok()?
      .with_timezone(&Utc);
    let service = ServiceType::parse(&fields[SERVICE_TYPE])?;

    Some(Self {
      request_start_time,
      operation: BlobOperation::parse(&fields[OPERATION_TYPE]),
      service,
      object_key: fields[REQUESTED_OBJECT_KEY].clone(),
    })
  }

  /// Account named by the object key.
  pub fn account(&self) -> Option<&str> {
    let key = self.object_key.strip_prefix('/')?;
    key.split('/').next().filter(|a| !a.is_empty())
  }

  /// The blob this row refers to, if it is a blob-service row with a
  /// `/account/container/blob` key.
  pub fn blob_path(&self) -> Option<BlobPath> {
    if self.service != ServiceType::Blob {
      return None;
    }
    let key = self.object_key.strip_prefix('/')?;
    let (_, rest) = key.split_once('/')?;
    BlobPath::parse(rest)
  }
}

/// Render a successful blob operation as a version 1.0 log line.
pub fn format_log_line(
  time: DateTime<Utc>,
  operation: &BlobOperation,
  account: &str,
  path: &BlobPath,
) -> String {
  let mut fields = vec![String::new(); FIELD_COUNT];
  fields[0] = LOG_VERSION.to_string();
  fields[REQUEST_START_TIME] = time.to_rfc3339();
  fields[OPERATION_TYPE] = operation.as_str().to_string();
  fields[3] = "Success".to_string();
  fields[4] = "201".to_string();
  fields[7] = "authenticated".to_string();
  fields[8] = account.to_string();
  fields[9] = account.to_string();
  fields[SERVICE_TYPE] = "blob".to_string();
  fields[REQUESTED_OBJECT_KEY] = format!("\"/{account}/{}/{}\"", path.container, path.blob);
  fields.join(";")
}

fn split_fields(line: &str) -> Vec<String> {
  let mut fields = Vec::new();
  let mut current = String::new();
  let mut quoted = false;

  for c in line.chars() {
    match c {
      '"' => quoted = !quoted,
      ';' if !quoted => fields.push(std::mem::take(&mut current)),
      _ => current.push(c),
    }
  }
  fields.push(current);
  fields
}
