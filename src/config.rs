use thiserror::Error;

use crate::auth::TokenAllowList;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
    pub storage: StorageConfig,
    /// Bearer tokens accepted by the API (TURBO_TOKEN, comma separated)
    pub turbo_tokens: TokenAllowList,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
    /// Deadline for a whole request, in seconds
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Gcs,
    Local,
    S3,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Prefer https:// for custom endpoints that omit a scheme
    pub secure: bool,
    /// Root directory for the local storage backend
    pub local_storage_path: String,
    pub s3: S3Config,
    pub gcs: GcsConfig,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Custom endpoint for S3-compatible storage (MinIO etc.)
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct GcsConfig {
    pub endpoint: String,
    /// Project that owns newly created buckets (required when backend is gcs)
    pub project_id: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to the metadata server)
    pub credentials_file: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            region: "us-east-1".to_string(),
        }
    }
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://storage.googleapis.com".to_string(),
            project_id: None,
            credentials_file: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            secure: false,
            local_storage_path: "./files".to_string(),
            s3: S3Config::default(),
            gcs: GcsConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Prefix a scheme-less endpoint with http:// or https:// depending on CLOUD_SECURE.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            let scheme = if self.secure { "https" } else { "http" };
            format!("{scheme}://{}", endpoint.trim_end_matches('/'))
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let turbo_tokens = var("TURBO_TOKEN")
            .map(|t| TokenAllowList::parse(&t))
            .unwrap_or_default();

        let listen_address =
            var("LISTEN_ADDRESS").unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let max_upload_size = var("MAX_UPLOAD_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(512 * 1024 * 1024); // 512MB

        let request_timeout_secs = var("REQUEST_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let backend = match var("CLOUD_PROVIDER_KIND")
            .unwrap_or_else(|| "s3".to_string())
            .to_lowercase()
            .as_str()
        {
            "s3" => StorageBackend::S3,
            "gcs" | "gcp" | "google" => StorageBackend::Gcs,
            "local" => StorageBackend::Local,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown CLOUD_PROVIDER_KIND '{other}' (expected s3, gcs or local)"
                )))
            }
        };

        let secure = var("CLOUD_SECURE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let local_storage_path =
            var("CLOUD_FILESYSTEM_PATH").unwrap_or_else(|| "./files".to_string());

        let s3 = S3Config {
            endpoint: var("AWS_ENDPOINT"),
            access_key_id: var("AWS_ACCESS_KEY_ID"),
            secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            region: var("AWS_S3_REGION_NAME").unwrap_or_else(|| "us-east-1".to_string()),
        };

        let gcs = GcsConfig {
            endpoint: var("GOOGLE_ENDPOINT")
                .unwrap_or_else(|| "https://storage.googleapis.com".to_string()),
            project_id: var("GOOGLE_PROJECT_ID"),
            credentials_file: var("GOOGLE_CREDENTIALS_FILE"),
        };

        let config = Config {
            listen_address,
            storage: StorageConfig {
                backend,
                secure,
                local_storage_path,
                s3,
                gcs,
            },
            turbo_tokens,
            max_upload_size,
            request_timeout_secs,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.turbo_tokens.is_empty() {
            return Err(ConfigError::ValidationError(
                "TURBO_TOKEN must contain at least one token".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::Gcs && self.storage.gcs.project_id.is_none() {
            return Err(ConfigError::ValidationError(
                "GOOGLE_PROJECT_ID is required when CLOUD_PROVIDER_KIND=gcs".to_string(),
            ));
        }

        if self.storage.s3.access_key_id.is_some() != self.storage.s3.secret_access_key.is_some() {
            return Err(ConfigError::ValidationError(
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set together".to_string(),
            ));
        }

        if self.max_upload_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_UPLOAD_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("TURBO_TOKEN", "abc")]).unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:8080");
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.local_storage_path, "./files");
        assert_eq!(config.storage.s3.region, "us-east-1");
        assert_eq!(config.request_timeout_secs, 300);
    }

    #[test]
    fn test_token_list_is_split_and_trimmed() {
        let config = load(&[("TURBO_TOKEN", " abc, def ,,ghi ")]).unwrap();
        let tokens = &config.turbo_tokens;
        assert_eq!(tokens.len(), 3);
        assert!(tokens.contains("abc") && tokens.contains("def") && tokens.contains("ghi"));
        assert!(!tokens.contains(" abc"));
    }

    #[test]
    fn test_missing_token_rejected() {
        assert!(load(&[]).is_err());
        assert!(load(&[("TURBO_TOKEN", " , ")]).is_err());
    }

    #[test]
    fn test_backend_selection() {
        let config = load(&[("TURBO_TOKEN", "t"), ("CLOUD_PROVIDER_KIND", "LOCAL")]).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Local);

        assert!(load(&[("TURBO_TOKEN", "t"), ("CLOUD_PROVIDER_KIND", "azure")]).is_err());
    }

    #[test]
    fn test_gcs_requires_project() {
        assert!(load(&[("TURBO_TOKEN", "t"), ("CLOUD_PROVIDER_KIND", "gcs")]).is_err());

        let config = load(&[
            ("TURBO_TOKEN", "t"),
            ("CLOUD_PROVIDER_KIND", "gcs"),
            ("GOOGLE_PROJECT_ID", "my-project"),
        ])
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Gcs);
        assert_eq!(config.storage.gcs.endpoint, "https://storage.googleapis.com");
    }

    #[test]
    fn test_s3_credentials_must_be_paired() {
        assert!(load(&[("TURBO_TOKEN", "t"), ("AWS_ACCESS_KEY_ID", "key")]).is_err());
    }

    #[test]
    fn test_endpoint_url_scheme() {
        let mut config = load(&[("TURBO_TOKEN", "t")]).unwrap();
        assert_eq!(
            config.storage.endpoint_url("minio:9000"),
            "http://minio:9000"
        );
        config.storage.secure = true;
        assert_eq!(
            config.storage.endpoint_url("minio:9000/"),
            "https://minio:9000"
        );
        assert_eq!(
            config.storage.endpoint_url("http://localhost:9000"),
            "http://localhost:9000"
        );
    }
}
