use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{
    backend_url, ByteStream, Container, Item, ObjectReader, ObjectStore, ObjectStoreError,
};
use crate::config::GcsConfig;

/// Tokens are refreshed this long before Google says they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Google Cloud Storage object store backend. Containers are buckets.
pub struct GcsStore {
    client: Arc<GcsClient>,
}

struct GcsClient {
    endpoint: String,
    project_id: String,
    http: Client,
    access_token: RwLock<AccessToken>,
    credentials_file: Option<String>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

impl GcsStore {
    pub async fn new(config: &GcsConfig) -> Result<Self, anyhow::Error> {
        let project_id = config
            .project_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("GCS backend requires a project id"))?;

        let client = GcsClient {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            project_id,
            http: Client::builder().build()?,
            access_token: RwLock::new(AccessToken {
                value: String::new(),
                expires_at: Instant::now(),
            }),
            credentials_file: config.credentials_file.clone(),
        };

        // Fail at startup rather than on the first request
        client.refresh_token().await?;

        Ok(Self {
            client: Arc::new(client),
        })
    }
}

impl GcsClient {
    async fn bearer(&self) -> Result<String, ObjectStoreError> {
        {
            let token = self.access_token.read().await;
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        self.refresh_token()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("GCS token refresh failed: {e}")))
    }

    async fn refresh_token(&self) -> Result<String, anyhow::Error> {
        let mut lock = self.access_token.write().await;
        // Another request may have refreshed while we waited for the lock
        if Instant::now() + TOKEN_REFRESH_MARGIN < lock.expires_at {
            return Ok(lock.value.clone());
        }

        let resp = if let Some(ref creds_path) = self.credentials_file {
            self.token_from_service_account(creds_path).await?
        } else {
            self.token_from_metadata_server().await?
        };

        tracing::debug!(expires_in = resp.expires_in, "Refreshed GCS access token");
        *lock = AccessToken {
            value: resp.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(resp.expires_in),
        };
        Ok(resp.access_token)
    }

    async fn token_from_service_account(&self, path: &str) -> Result<TokenResponse, anyhow::Error> {
        let key_json = tokio::fs::read_to_string(path).await?;
        let key: ServiceAccountKey = serde_json::from_str(&key_json)?;

        let now = chrono::Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": key.client_email,
            "scope": "https://www.googleapis.com/auth/devstorage.read_write",
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        // Build JWT (header.claims.signature)
        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
        let unsigned = format!("{header}.{payload}");

        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp = self
            .http
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    async fn token_from_metadata_server(&self) -> Result<TokenResponse, anyhow::Error> {
        let resp = self
            .http
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!("{}/storage/v1/b/{}", self.endpoint, bucket)
    }

    fn create_bucket_url(&self) -> String {
        format!(
            "{}/storage/v1/b?project={}",
            self.endpoint,
            urlencoding::encode(&self.project_id)
        )
    }

    fn upload_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint,
            bucket,
            urlencoding::encode(key)
        )
    }

    fn metadata_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            bucket,
            urlencoding::encode(key)
        )
    }

    fn media_url(&self, bucket: &str, key: &str) -> String {
        format!("{}?alt=media", self.metadata_url(bucket, key))
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, urlencoding::encode(key))
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn container(&self, name: &str) -> Result<Arc<dyn Container>, ObjectStoreError> {
        let token = self.client.bearer().await?;

        let resp = self
            .client
            .http
            .get(self.client.bucket_url(name))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            tracing::info!(bucket = %name, "Creating GCS bucket");
            let resp = self
                .client
                .http
                .post(self.client.create_bucket_url())
                .bearer_auth(&token)
                .json(&serde_json::json!({ "name": name }))
                .send()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

            // 409 means a concurrent request created it first
            if !resp.status().is_success() && resp.status() != StatusCode::CONFLICT {
                return Err(backend_failure("bucket create", resp).await);
            }
        } else if !resp.status().is_success() {
            return Err(backend_failure("bucket lookup", resp).await);
        }

        Ok(Arc::new(GcsBucket {
            client: Arc::clone(&self.client),
            name: name.to_string(),
        }))
    }
}

struct GcsBucket {
    client: Arc<GcsClient>,
    name: String,
}

#[async_trait]
impl Container for GcsBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        length: Option<u64>,
    ) -> Result<Box<dyn Item>, ObjectStoreError> {
        let token = self.client.bearer().await?;

        let mut request = self
            .client
            .http
            .post(self.client.upload_url(&self.name, key))
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream");
        if let Some(length) = length {
            request = request.header(reqwest::header::CONTENT_LENGTH, length);
        }

        let resp = request
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(backend_failure("upload", resp).await);
        }

        let resource: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        Ok(Box::new(self.item_from_resource(key, &resource)?))
    }

    async fn item(&self, key: &str) -> Result<Box<dyn Item>, ObjectStoreError> {
        let token = self.client.bearer().await?;

        let resp = self
            .client
            .http
            .get(self.client.metadata_url(&self.name, key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(backend_failure("metadata lookup", resp).await);
        }

        let resource: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        Ok(Box::new(self.item_from_resource(key, &resource)?))
    }
}

impl GcsBucket {
    /// Flatten the scalar fields of a GCS object resource into string metadata.
    fn item_from_resource(
        &self,
        key: &str,
        resource: &serde_json::Value,
    ) -> Result<GcsObject, ObjectStoreError> {
        let mut metadata = HashMap::new();
        if let Some(fields) = resource.as_object() {
            for (name, value) in fields {
                match value {
                    serde_json::Value::String(s) => {
                        metadata.insert(name.clone(), s.clone());
                    }
                    serde_json::Value::Number(n) => {
                        metadata.insert(name.clone(), n.to_string());
                    }
                    serde_json::Value::Bool(b) => {
                        metadata.insert(name.clone(), b.to_string());
                    }
                    _ => {}
                }
            }
        }

        // GCS reports size as a decimal string
        let size = metadata.get("size").and_then(|s| s.parse().ok());

        Ok(GcsObject {
            client: Arc::clone(&self.client),
            bucket: self.name.clone(),
            key: key.to_string(),
            size,
            url: backend_url(&self.client.public_url(&self.name, key))?,
            metadata,
        })
    }
}

struct GcsObject {
    client: Arc<GcsClient>,
    bucket: String,
    key: String,
    size: Option<u64>,
    url: url::Url,
    metadata: HashMap<String, String>,
}

#[async_trait]
impl Item for GcsObject {
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
        let token = self.client.bearer().await?;

        let resp = self
            .client
            .http
            .get(self.client.media_url(&self.bucket, &self.key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(self.key.clone()));
        }
        if !resp.status().is_success() {
            return Err(backend_failure("download", resp).await);
        }

        // Length of this download, which may be a newer generation than the lookup saw
        let size = resp.content_length();
        Ok(ObjectReader {
            size,
            stream: Box::pin(resp.bytes_stream().map_err(std::io::Error::other)),
        })
    }
}

async fn backend_failure(operation: &str, resp: reqwest::Response) -> ObjectStoreError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    ObjectStoreError::Backend(format!("GCS {operation} failed ({status}): {body}"))
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    // Strip PEM headers and decode base64
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &der_b64)?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}
