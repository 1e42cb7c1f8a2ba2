use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};

use super::{
    check_length, ByteStream, Container, Item, ObjectReader, ObjectStore, ObjectStoreError,
};

/// Local filesystem object store for development and single-host deployments.
/// Each container is a directory under `base_path`.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(base_path.as_ref())?;
        // Absolute path so object URLs are valid file:// URLs
        let base_path = std::fs::canonicalize(base_path.as_ref())?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn container(&self, name: &str) -> Result<Arc<dyn Container>, ObjectStoreError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(ObjectStoreError::InvalidKey(name.to_string()));
        }

        let path = self.base_path.join(name);
        tokio::fs::create_dir_all(&path).await?;

        Ok(Arc::new(LocalContainer {
            name: name.to_string(),
            path,
        }))
    }
}

struct LocalContainer {
    name: String,
    path: PathBuf,
}

impl LocalContainer {
    /// Keys are percent-encoded into a single file name, so separators in a key
    /// never reach the filesystem.
    fn object_path(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.is_empty() || key == "." || key == ".." {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.path.join(urlencoding::encode(key).as_ref()))
    }

    /// Temporary upload file. Encoded keys only use `%` before two hex digits,
    /// so this name can never collide with an object.
    fn upload_path(&self) -> PathBuf {
        self.path.join(format!("%upload-{}", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl Container for LocalContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        length: Option<u64>,
    ) -> Result<Box<dyn Item>, ObjectStoreError> {
        let path = self.object_path(key)?;
        let upload_path = self.upload_path();

        // Write to a side file and rename, so readers only ever see whole objects
        if let Err(e) = write_stream(&upload_path, body, length).await {
            let _ = tokio::fs::remove_file(&upload_path).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&upload_path, &path).await {
            let _ = tokio::fs::remove_file(&upload_path).await;
            return Err(e.into());
        }

        Ok(Box::new(LocalItem::load(key, path).await?))
    }

    async fn item(&self, key: &str) -> Result<Box<dyn Item>, ObjectStoreError> {
        let path = self.object_path(key)?;
        Ok(Box::new(LocalItem::load(key, path).await?))
    }
}

async fn write_stream(
    path: &Path,
    body: ByteStream,
    length: Option<u64>,
) -> Result<(), ObjectStoreError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut reader = StreamReader::new(body);
    let written = tokio::io::copy(&mut reader, &mut file).await?;
    check_length(length, written)?;

    file.sync_all().await?;
    Ok(())
}

struct LocalItem {
    key: String,
    path: PathBuf,
    size: u64,
    url: url::Url,
    metadata: HashMap<String, String>,
}

impl LocalItem {
    async fn load(key: &str, path: PathBuf) -> Result<Self, ObjectStoreError> {
        let stat = match tokio::fs::metadata(&path).await {
            Ok(stat) if stat.is_file() => stat,
            Ok(_) => return Err(ObjectStoreError::NotFound(key.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let url = url::Url::from_file_path(&path).map_err(|_| {
            ObjectStoreError::Backend(format!("no file URL for {}", path.display()))
        })?;

        let mut metadata = HashMap::new();
        metadata.insert("size".to_string(), stat.len().to_string());
        if let Ok(modified) = stat.modified() {
            let modified: DateTime<Utc> = modified.into();
            metadata.insert("modified".to_string(), modified.to_rfc3339());
        }

        Ok(Self {
            key: key.to_string(),
            path,
            size: stat.len(),
            url,
            metadata,
        })
    }
}

#[async_trait]
impl Item for LocalItem {
    fn key(&self) -> &str {
        &self.key
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn url(&self) -> url::Url {
        self.url.clone()
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    async fn open(&self) -> Result<ObjectReader, ObjectStoreError> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(self.key.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        // Size the handle being streamed; the key may have been replaced since lookup
        let size = file.metadata().await?.len();
        Ok(ObjectReader {
            size: Some(size),
            stream: Box::pin(ReaderStream::new(file)),
        })
    }
}
