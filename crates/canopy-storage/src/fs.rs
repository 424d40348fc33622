use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::Mutex;

use crate::blob::{BlobItem, BlobProperties, BlobStore};
use crate::error::StorageError;
use crate::memory::LeaseTable;
use crate::resource::BlobPath;

const METADATA_DIR: &str = ".canopy-metadata";

/// Filesystem-based blob store for local development.
///
/// Containers are directories under the root and blob names map to relative
/// file paths, so a blob named `2024/report.csv` lives at
/// `{root}/{container}/2024/report.csv`:
/// ```text
/// {root}/
/// ├── input/
/// │   └── 2024/report.csv
/// └── .canopy-metadata/
///     └── input/2024/report.csv.json
/// ```
/// Last-modified times come from file mtimes. Leases are tracked in process
/// and do not coordinate between processes sharing a directory.
pub struct FsBlobStore {
  root: PathBuf,
  leases: Mutex<LeaseTable>,
}

impl FsBlobStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      leases: Mutex::new(LeaseTable::default()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn container_dir(&self, container: &str) -> PathBuf {
    self.root.join(container)
  }

  fn blob_file(&self, path: &BlobPath) -> PathBuf {
    self.container_dir(&path.container).join(&path.blob)
  }

  fn metadata_file(&self, path: &BlobPath) -> PathBuf {
    self
      .root
      .join(METADATA_DIR)
      .join(&path.container)
      .join(format!("{}.json", path.blob))
  }

  async fn read_metadata(&self, path: &BlobPath) -> Result<HashMap<String, String>, StorageError> {
    match fs::read_to_string(self.metadata_file(path)).await {
      Ok(content) => Ok(serde_json::from_str(&content)?),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
      Err(e) => Err(StorageError::Io(e)),
    }
  }

  async fn require_blob(&self, path: &BlobPath) -> Result<(), StorageError> {
    match fs::metadata(self.blob_file(path)).await {
      Ok(meta) if meta.is_file() => Ok(()),
      Ok(_) => Err(StorageError::NotFound(path.to_string())),
      Err(e) => Err(map_not_found(e, path.to_string())),
    }
  }
}

fn map_not_found(e: std::io::Error, what: String) -> StorageError {
  if e.kind() == std::io::ErrorKind::NotFound {
    StorageError::NotFound(what)
  } else {
    StorageError::Io(e)
  }
}

fn blob_name(relative: &Path) -> Option<String> {
  let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
  Some(parts?.join("/"))
}

#[async_trait]
impl BlobStore for FsBlobStore {
  async fn create_container_if_not_exists(&self, container: &str) -> Result<bool, StorageError> {
    let dir = self.container_dir(container);
    if fs::try_exists(&dir).await? {
      return Ok(false);
    }
    fs::create_dir_all(&dir).await?;
    Ok(true)
  }

  async fn list_blobs(&self, container: &str) -> Result<Vec<BlobItem>, StorageError> {
    let base = self.container_dir(container);
    let mut pending = vec![base.clone()];
    let mut items = Vec::new();

    while let Some(dir) = pending.pop() {
      let mut entries = fs::read_dir(&dir)
        .await
        .map_err(|e| map_not_found(e, container.to_string()))?;

      while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let meta = entry.metadata().await?;
        if meta.is_dir() {
          pending.push(path);
          continue;
        }

        let Some(name) = path.strip_prefix(&base).ok().and_then(blob_name) else {
          continue;
        };
        items.push(BlobItem {
          path: BlobPath::new(container, name),
          last_modified: DateTime::<Utc>::from(meta.modified()?),
        });
      }
    }

    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
  }

  async fn properties(&self, path: &BlobPath) -> Result<Option<BlobProperties>, StorageError> {
    let meta = match fs::metadata(self.blob_file(path)).await {
      Ok(meta) if meta.is_file() => meta,
      Ok(_) => return Ok(None),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(StorageError::Io(e)),
    };

    Ok(Some(BlobProperties {
      last_modified: DateTime::<Utc>::from(meta.modified()?),
      content_length: meta.len(),
      metadata: self.read_metadata(path).await?,
      lease_state: self.leases.lock().await.state(path),
    }))
  }

  async fn upload(
    &self,
    path: &BlobPath,
    data: Bytes,
    overwrite: bool,
  ) -> Result<(), StorageError> {
    self.leases.lock().await.check_write(path, None)?;

    if !fs::try_exists(self.container_dir(&path.container)).await? {
      return Err(StorageError::NotFound(path.container.clone()));
    }

    let file = self.blob_file(path);
    if !overwrite && fs::try_exists(&file).await? {
      return Err(StorageError::Conflict(format!("{path} already exists")));
    }
    if let Some(parent) = file.parent() {
      fs::create_dir_all(parent).await?;
    }
    fs::write(&file, &data).await?;

    match fs::remove_file(self.metadata_file(path)).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(StorageError::Io(e)),
    }
  }

  async fn download(&self, path: &BlobPath) -> Result<Bytes, StorageError> {
    let data = fs::read(self.blob_file(path))
      .await
      .map_err(|e| map_not_found(e, path.to_string()))?;
    Ok(Bytes::from(data))
  }

  async fn set_metadata(
    &self,
    path: &BlobPath,
    metadata: HashMap<String, String>,
    lease_id: Option<&str>,
  ) -> Result<(), StorageError> {
    self.leases.lock().await.check_write(path, lease_id)?;
    self.require_blob(path).await?;

    let file = self.metadata_file(path);
    if let Some(parent) = file.parent() {
      fs::create_dir_all(parent).await?;
    }
    fs::write(&file, serde_json::to_vec(&metadata)?).await?;
    Ok(())
  }

  async fn acquire_lease(
    &self,
    path: &BlobPath,
    duration: Duration,
    proposed_lease_id: Option<&str>,
  ) -> Result<String, StorageError> {
    self.require_blob(path).await?;
    self
      .leases
      .lock()
      .await
      .acquire(path, duration, proposed_lease_id)
  }

  async fn renew_lease(&self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError> {
    self.leases.lock().await.renew(path, lease_id)
  }

  async fn release_lease(&self, path: &BlobPath, lease_id: &str) -> Result<(), StorageError> {
    self.leases.lock().await.release(path, lease_id)
  }
}
