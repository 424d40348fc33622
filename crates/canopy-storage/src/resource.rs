//! Identity of storage resources. Names that the service treats as case
//! insensitive are normalized to lower case, so equal resources compare and
//! hash equal.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A resource handle with a canonical URI.
///
/// Handles compare and hash by URI, never by identity, so independently
/// constructed handles for the same resource deduplicate in maps and sets.
pub trait ResourceIdentity {
  fn uri(&self) -> &str;
}

macro_rules! uri_identity {
  ($ty:ty) => {
    impl ResourceIdentity for $ty {
      fn uri(&self) -> &str {
        &self.uri
      }
    }

    impl PartialEq for $ty {
      fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
      }
    }

    impl Eq for $ty {}

    impl Hash for $ty {
      fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
      }
    }

    impl fmt::Display for $ty {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
      }
    }
  };
}

/// A blob container within a storage account.
///
/// Container names are case-insensitive and normalized to lowercase.
#[derive(Debug, Clone)]
pub struct ContainerRef {
  account: String,
  name: String,
  uri: String,
}

impl ContainerRef {
  pub fn new(account: impl Into<String>, name: impl AsRef<str>) -> Self {
    let account = account.into();
    let name = name.as_ref().to_lowercase();
    let uri = format!("canopy://{account}/blob/{name}");
    Self { account, name, uri }
  }

  pub fn account(&self) -> &str {
    &self.account
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// A storage queue. Queue names are normalized to lowercase.
#[derive(Debug, Clone)]
pub struct QueueRef {
  account: String,
  name: String,
  uri: String,
}

impl QueueRef {
  pub fn new(account: impl Into<String>, name: impl AsRef<str>) -> Self {
    let account = account.into();
    let name = name.as_ref().to_lowercase();
    let uri = format!("canopy://{account}/queue/{name}");
    Self { account, name, uri }
  }

  pub fn account(&self) -> &str {
    &self.account
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// A message-bus entity: a queue, or a topic subscription written as
/// `topic/subscriptions/name`.
#[derive(Debug, Clone)]
pub struct EntityRef {
  account: String,
  path: String,
  uri: String,
}

impl EntityRef {
  pub fn new(account: impl Into<String>, path: impl AsRef<str>) -> Self {
    let account = account.into();
    let path = path.as_ref().to_lowercase();
    let uri = format!("canopy://{account}/bus/{path}");
    Self { account, path, uri }
  }

  pub fn account(&self) -> &str {
    &self.account
  }

  pub fn path(&self) -> &str {
    &self.path
  }
}

uri_identity!(ContainerRef);
uri_identity!(QueueRef);
uri_identity!(EntityRef);

/// The location of a blob: container plus blob name.
///
/// Blob names may contain `/` and are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobPath {
  pub container: String,
  pub blob: String,
}

impl BlobPath {
  pub fn new(container: impl Into<String>, blob: impl Into<String>) -> Self {
    Self {
      container: container.into(),
      blob: blob.into(),
    }
  }

  /// Split `container/blob/name` at the first `/`.
  pub fn parse(path: &str) -> Option<Self> {
    let (container, blob) = path.split_once('/')?;
    if container.is_empty() || blob.is_empty() {
      return None;
    }
    Some(Self::new(container, blob))
  }
}

impl fmt::Display for BlobPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.container, self.blob)
  }
}
