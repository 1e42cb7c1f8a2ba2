//! Shared test helpers for router and handler tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::auth::TokenAllowList;
use crate::config::{Config, StorageBackend, StorageConfig};
use crate::object_store::{
    ByteStream, Container, Item, LocalStore, ObjectStore, ObjectStoreError,
};
use crate::AppState;

pub const TEST_TOKEN: &str = "abc";

pub fn test_config(temp_dir: &tempfile::TempDir) -> Config {
    Config {
        listen_address: "127.0.0.1:0".to_string(),
        storage: StorageConfig {
            backend: StorageBackend::Local,
            local_storage_path: temp_dir.path().join("files").to_string_lossy().to_string(),
            ..Default::default()
        },
        turbo_tokens: TokenAllowList::new([TEST_TOKEN]),
        max_upload_size: 1024 * 1024, // 1MB for tests
        request_timeout_secs: 30,
    }
}

/// Create a test AppState backed by a local object store in a temporary directory.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let config = test_config(temp_dir);
    let object_store = LocalStore::new(&config.storage.local_storage_path)
        .expect("Failed to create test object store");
    Arc::new(AppState::new(config, Arc::new(object_store)))
}

/// Create a test AppState around an arbitrary object store.
pub fn test_state_with_store(
    temp_dir: &tempfile::TempDir,
    object_store: Arc<dyn ObjectStore>,
) -> Arc<AppState> {
    Arc::new(AppState::new(test_config(temp_dir), object_store))
}

/// A backend that is always unreachable.
pub struct UnavailableStore;

#[async_trait]
impl ObjectStore for UnavailableStore {
    async fn container(&self, _name: &str) -> Result<Arc<dyn Container>, ObjectStoreError> {
        Err(ObjectStoreError::Backend("connection refused".to_string()))
    }
}

/// A backend with a defect: every call panics.
pub struct PanickingStore;

#[async_trait]
impl ObjectStore for PanickingStore {
    async fn container(&self, name: &str) -> Result<Arc<dyn Container>, ObjectStoreError> {
        panic!("container lookup exploded for {name}");
    }
}

/// A local store where another writer replaces every object right after it
/// is looked up, before the reader opens it.
pub struct ReplacingStore {
    pub inner: LocalStore,
    pub replacement: Bytes,
}

#[async_trait]
impl ObjectStore for ReplacingStore {
    async fn container(&self, name: &str) -> Result<Arc<dyn Container>, ObjectStoreError> {
        Ok(Arc::new(ReplacingContainer {
            inner: self.inner.container(name).await?,
            replacement: self.replacement.clone(),
        }))
    }
}

struct ReplacingContainer {
    inner: Arc<dyn Container>,
    replacement: Bytes,
}

#[async_trait]
impl Container for ReplacingContainer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        length: Option<u64>,
    ) -> Result<Box<dyn Item>, ObjectStoreError> {
        self.inner.put(key, body, length).await
    }

    async fn item(&self, key: &str) -> Result<Box<dyn Item>, ObjectStoreError> {
        let item = self.inner.item(key).await?;
        let body: ByteStream = Box::pin(futures::stream::iter([Ok::<_, std::io::Error>(
            self.replacement.clone(),
        )]));
        self.inner
            .put(key, body, Some(self.replacement.len() as u64))
            .await?;
        Ok(item)
    }
}
