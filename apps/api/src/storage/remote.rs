use std::path::Path;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::info;

use crate::config::RemoteStorageConfig;
use crate::storage::{content_type_for, StorageError};

/// Remote blob storage for migrated artifacts.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Uploads a local file under `key` and returns its public location.
    async fn upload(&self, local: &Path, key: &str) -> Result<String, StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// S3 (or S3-compatible, e.g. MinIO) implementation.
#[derive(Clone)]
pub struct S3Storage {
    client: S3Client,
    bucket: String,
    region: String,
    endpoint: Option<String>,
}

impl S3Storage {
    pub async fn connect(config: &RemoteStorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "cv-analyzer-static",
        );

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        info!("S3 storage configured for bucket {}", config.bucket);

        Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        }
    }
}

/// Public URL of an object, for custom endpoints and for AWS.
pub fn object_url(bucket: &str, region: &str, endpoint: Option<&str>, key: &str) -> String {
    match endpoint {
        Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key),
        None => format!("https://{bucket}.s3.{region}.amazonaws.com/{key}"),
    }
}

#[async_trait]
impl RemoteStorage for S3Storage {
    async fn upload(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| StorageError::Remote(format!("cannot read {}: {e}", local.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type_for(local))
            .send()
            .await
            .map_err(|e| StorageError::Remote(format!("S3 upload failed: {e}")))?;

        info!("Uploaded artifact to s3://{}/{}", self.bucket, key);
        Ok(object_url(
            &self.bucket,
            &self.region,
            self.endpoint.as_deref(),
            key,
        ))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Remote(format!("S3 download failed: {e}")))?;

        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Remote(format!("S3 download interrupted: {e}")))?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Remote(format!("S3 delete failed: {e}")))?;
        Ok(())
    }
}
