use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::utils::error::ConfigurationError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the full object body
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError>;
}

/// S3 (or S3-compatible) read wrapper
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Static credentials are required up front; missing ones abort startup
    pub fn new(config: &StorageConfig) -> Result<Self, ConfigurationError> {
        let access_key_id = non_empty(&config.access_key_id)
            .ok_or_else(|| ConfigurationError::Missing("AWS_ACCESS_KEY_ID".to_string()))?;
        let secret_access_key = non_empty(&config.secret_access_key)
            .ok_or_else(|| ConfigurationError::Missing("AWS_SECRET_ACCESS_KEY".to_string()))?;

        let credentials =
            Credentials::new(access_key_id, secret_access_key, None, None, "settings");

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = non_empty(&config.endpoint_url) {
            builder = builder.endpoint_url(endpoint);
        }

        info!(region = %config.region, "S3 client initialized");

        Ok(Self {
            client: Client::from_conf(builder.build()),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        debug!(bucket, key, "Fetching object");

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_get_error(bucket, key, e))?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Unavailable(format!("Failed to read object body: {}", e)))?;

        Ok(body.into_bytes())
    }
}

fn classify_get_error(bucket: &str, key: &str, err: SdkError<GetObjectError>) -> StorageError {
    match err.as_service_error() {
        Some(GetObjectError::NoSuchKey(_)) => StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        Some(service)
            if matches!(
                service.code(),
                Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch")
            ) =>
        {
            StorageError::AccessDenied(format!("s3://{}/{}: {}", bucket, key, service))
        }
        _ => {
            let detail = DisplayErrorContext(&err).to_string();
            warn!(bucket, key, "S3 get_object failed: {}", detail);
            StorageError::Unavailable(detail)
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_fail_at_construction() {
        let config = StorageConfig::default();
        assert!(matches!(
            S3ObjectStore::new(&config),
            Err(ConfigurationError::Missing(name)) if name == "AWS_ACCESS_KEY_ID"
        ));

        let config = StorageConfig {
            access_key_id: Some("AKIA".to_string()),
            secret_access_key: Some("".to_string()),
            ..StorageConfig::default()
        };
        assert!(matches!(
            S3ObjectStore::new(&config),
            Err(ConfigurationError::Missing(name)) if name == "AWS_SECRET_ACCESS_KEY"
        ));
    }

    #[test]
    fn test_construction_with_credentials() {
        let config = StorageConfig {
            access_key_id: Some("AKIA".to_string()),
            secret_access_key: Some("secret".to_string()),
            endpoint_url: Some("http://127.0.0.1:9000".to_string()),
            force_path_style: true,
            ..StorageConfig::default()
        };
        assert!(S3ObjectStore::new(&config).is_ok());
    }
}
