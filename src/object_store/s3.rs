use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region, SharedCredentialsProvider};
use aws_sdk_s3::primitives::{ByteStream as S3Body, DateTimeFormat};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use super::{
    backend_url, check_length, ByteStream, Container, Item, ObjectReader, ObjectStore,
    ObjectStoreError,
};
use crate::config::StorageConfig;

/// Uploads larger than this use multipart upload with parts of about this size.
/// S3 requires every part but the last to be at least 5 MiB.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Amazon S3 (or S3-compatible) object store backend. Containers are buckets.
pub struct S3Store {
    client: Client,
    region: String,
    /// Base URL used to report object locations
    url_base: String,
}

impl S3Store {
    pub async fn new(config: &StorageConfig) -> Result<Self, anyhow::Error> {
        let s3 = &config.s3;
        let endpoint = s3.endpoint.as_deref().map(|ep| config.endpoint_url(ep));

        let mut config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(s3.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&s3.access_key_id, &s3.secret_access_key) {
            let credentials = Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "turbo-cache-gateway",
            );
            config_builder =
                config_builder.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        // Add custom endpoint if provided (for MinIO)
        if let Some(ref ep) = endpoint {
            config_builder = config_builder.endpoint_url(ep);
        }

        let sdk_config = config_builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        // Force path-style addressing for MinIO compatibility
        if endpoint.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let url_base = endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", s3.region));

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            region: s3.region.clone(),
            url_base,
        })
    }

    async fn create_bucket(&self, name: &str) -> Result<(), ObjectStoreError> {
        tracing::info!(bucket = %name, "Creating S3 bucket");

        let mut request = self.client.create_bucket().bucket(name);
        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(e) => Err(ObjectStoreError::Backend(format!(
                "S3 bucket create failed: {e}"
            ))),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn container(&self, name: &str) -> Result<Arc<dyn Container>, ObjectStoreError> {
        match self.client.head_bucket().bucket(name).send().await {
            Ok(_) => {}
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                self.create_bucket(name).await?;
            }
            Err(e) => {
                return Err(ObjectStoreError::Backend(format!(
                    "S3 bucket lookup failed: {e}"
                )))
            }
        }

        Ok(Arc::new(S3Bucket {
            client: self.client.clone(),
            name: name.to_string(),
            url_base: self.url_base.clone(),
        }))
    }
}

struct S3Bucket {
    client: Client,
    name: String,
    url_base: String,
}

#[async_trait]
impl Container for S3Bucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        key: &str,
        mut body: ByteStream,
        length: Option<u64>,
    ) -> Result<Box<dyn Item>, ObjectStoreError> {
        let mut part = BytesMut::new();
        let complete = fill_part(&mut body, &mut part).await?;

        if complete {
            check_length(length, part.len() as u64)?;
            self.put_single(key, part.freeze()).await?;
        } else {
            self.put_multipart(key, body, part, length).await?;
        }

        self.item(key).await
    }

    async fn item(&self, key: &str) -> Result<Box<dyn Item>, ObjectStoreError> {
        let head = match self
            .client
            .head_object()
            .bucket(&self.name)
            .key(key)
            .send()
            .await
        {
            Ok(head) => head,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                return Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => {
                return Err(ObjectStoreError::Backend(format!(
                    "S3 metadata lookup failed: {e}"
                )))
            }
        };

        let size = head.content_length().and_then(|n| u64::try_from(n).ok());

        let mut metadata = HashMap::new();
        if let Some(size) = size {
            metadata.insert("size".to_string(), size.to_string());
        }
        if let Some(etag) = head.e_tag() {
            metadata.insert("etag".to_string(), etag.to_string());
        }
        if let Some(content_type) = head.content_type() {
            metadata.insert("content_type".to_string(), content_type.to_string());
        }
        if let Some(modified) = head
            .last_modified()
            .and_then(|t| t.fmt(DateTimeFormat::DateTime).ok())
        {
            metadata.insert("last_modified".to_string(), modified);
        }
        if let Some(user) = head.metadata() {
            metadata.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let url = backend_url(&format!(
            "{}/{}/{}",
            self.url_base,
            self.name,
            urlencoding::encode(key)
        ))?;

        Ok(Box::new(S3Object {
            client: self.client.clone(),
            bucket: self.name.clone(),
            key: key.to_string(),
            size,
            url,
            metadata,
        }))
    }
}

impl S3Bucket {
    async fn put_single(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.name)
            .key(key)
            .content_type("application/octet-stream")
            .content_length(data.len() as i64)
            .body(S3Body::from(data))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("S3 upload failed: {e}")))?;
        Ok(())
    }

    /// Upload in `PART_SIZE` parts so at most one part is buffered at a time.
    /// The object only becomes visible once the upload is completed.
    async fn put_multipart(
        &self,
        key: &str,
        body: ByteStream,
        first_part: BytesMut,
        length: Option<u64>,
    ) -> Result<(), ObjectStoreError> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.name)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("S3 multipart create failed: {e}")))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| ObjectStoreError::Backend("S3 returned no upload id".to_string()))?
            .to_string();

        let parts = match self
            .upload_parts(key, &upload_id, body, first_part, length)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.name)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(%key, error = %abort, "Failed to abort S3 multipart upload");
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.name)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                ObjectStoreError::Backend(format!("S3 multipart complete failed: {e}"))
            })?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut body: ByteStream,
        mut part: BytesMut,
        length: Option<u64>,
    ) -> Result<Vec<CompletedPart>, ObjectStoreError> {
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut complete = false;

        while !part.is_empty() {
            let part_number = parts.len() as i32 + 1;
            let data = part.split().freeze();
            total += data.len() as u64;

            let output = self
                .client
                .upload_part()
                .bucket(&self.name)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_length(data.len() as i64)
                .body(S3Body::from(data))
                .send()
                .await
                .map_err(|e| ObjectStoreError::Backend(format!("S3 part upload failed: {e}")))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .build(),
            );

            if !complete {
                complete = fill_part(&mut body, &mut part).await?;
            }
        }

        check_length(length, total)?;
        Ok(parts)
    }
}

/// Buffer body chunks until `buf` holds at least `PART_SIZE` bytes.
/// Returns true once the body is exhausted.
async fn fill_part(body: &mut ByteStream, buf: &mut BytesMut) -> Result<bool, std::io::Error> {
    while buf.len() < PART_SIZE {
        match body.try_next().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => return Ok(true),
        }
    }
    Ok(false)
}

struct S3Object {
    client: Client,
    bucket: String,
    key: String,
    size: Option<u64>,
    url: url::Url,
    metadata: HashMap<String, String>,
}

#[async_trait]
impl Item for S3Object {
    fn key(&self) -> &str {
        &self.key
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn url(&self) -> url::Url {
        self.url.clone()
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    async fn open(&self) -> Result<ObjectReader, ObjectStoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(ObjectStoreError::NotFound(self.key.clone()))
            }
            Err(e) => {
                return Err(ObjectStoreError::Backend(format!(
                    "S3 download failed: {e}"
                )))
            }
        };

        // Length of this response, which may be newer than the HEAD seen by item()
        let size = output.content_length().and_then(|n| u64::try_from(n).ok());
        Ok(ObjectReader {
            size,
            stream: Box::pin(ReaderStream::new(output.body.into_async_read())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(sizes: &[usize]) -> ByteStream {
        let chunks: Vec<Result<Bytes, std::io::Error>> = sizes
            .iter()
            .map(|&n| Ok(Bytes::from(vec![1u8; n])))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_small_body_fits_one_part() {
        let mut body = chunks(&[10, 20]);
        let mut buf = BytesMut::new();
        assert!(fill_part(&mut body, &mut buf).await.unwrap());
        assert_eq!(buf.len(), 30);
    }

    #[tokio::test]
    async fn test_large_body_is_buffered_one_part_at_a_time() {
        let chunk = 1024 * 1024;
        let mut body = chunks(&[chunk; 20]);
        let mut buf = BytesMut::new();

        assert!(!fill_part(&mut body, &mut buf).await.unwrap());
        assert_eq!(buf.len(), PART_SIZE);

        buf.clear();
        assert!(!fill_part(&mut body, &mut buf).await.unwrap());
        assert_eq!(buf.len(), PART_SIZE);

        buf.clear();
        assert!(fill_part(&mut body, &mut buf).await.unwrap());
        assert_eq!(buf.len(), 4 * chunk);
    }

    #[tokio::test]
    async fn test_stream_error_is_reported() {
        let mut body: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("client went away")),
        ]));
        let mut buf = BytesMut::new();
        assert!(fill_part(&mut body, &mut buf).await.is_err());
    }
}
