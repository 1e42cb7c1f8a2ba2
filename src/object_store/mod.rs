mod gcs;
mod local;
mod s3;

pub use gcs::GcsStore;
pub use local::LocalStore;
pub use s3::S3Store;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object key: {0:?}")]
    InvalidKey(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A stream of object content chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Object content opened for reading. `size` describes the same handle or
/// response that `stream` reads from, never an earlier lookup.
pub struct ObjectReader {
    pub size: Option<u64>,
    pub stream: ByteStream,
}

/// Abstraction over object storage backends.
/// Containers are resolved per call and never cached by callers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Resolve the named container, creating it when it does not exist yet.
    async fn container(&self, name: &str) -> Result<Arc<dyn Container>, ObjectStoreError>;
}

/// A storage namespace (bucket or directory) holding objects by key.
/// Keys are opaque: a key never addresses anything outside its container.
#[async_trait]
pub trait Container: Send + Sync {
    fn name(&self) -> &str;

    /// Write `body` under `key`, replacing any previous object.
    /// When `length` is given, a body of any other size is rejected.
    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        length: Option<u64>,
    ) -> Result<Box<dyn Item>, ObjectStoreError>;

    /// Look up an existing object. Fails with `NotFound` when absent.
    async fn item(&self, key: &str) -> Result<Box<dyn Item>, ObjectStoreError>;
}

/// A stored object.
#[async_trait]
pub trait Item: Send + Sync {
    fn key(&self) -> &str;
    fn size(&self) -> Option<u64>;
    fn url(&self) -> url::Url;
    fn metadata(&self) -> &HashMap<String, String>;

    /// Open the full object content as a stream.
    async fn open(&self) -> Result<ObjectReader, ObjectStoreError>;
}

/// Fail when a declared body length does not match what was received.
fn check_length(expected: Option<u64>, received: u64) -> Result<(), ObjectStoreError> {
    match expected {
        Some(expected) if expected != received => Err(ObjectStoreError::Backend(format!(
            "expected {expected} bytes but received {received}"
        ))),
        _ => Ok(()),
    }
}

/// Build a URL from a string the backend constructed itself.
fn backend_url(raw: &str) -> Result<url::Url, ObjectStoreError> {
    url::Url::parse(raw).map_err(|e| ObjectStoreError::Backend(format!("invalid URL {raw}: {e}")))
}
