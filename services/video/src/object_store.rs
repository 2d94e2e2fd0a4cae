use crate::config::S3Config;
use crate::key_builder::StorageKey;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to read upload source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Failed to sign {bucket}/{key}: {message}")]
    Sign {
        bucket: String,
        key: String,
        message: String,
    },
}

/// A time-limited retrieval URL. Valid from `signed_at` until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub signed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Durable object storage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `source` under `key` with `content_type` attached.
    async fn put(&self, key: &StorageKey, content_type: &str, source: &Path) -> Result<(), StorageError>;

    /// Mint a retrieval URL for `bucket`/`key` valid for `ttl` from now.
    async fn sign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<SignedUrl, StorageError>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Self::from_client(client, config)
    }

    /// Wrap an already configured client
    pub fn from_client(client: S3Client, config: &S3Config) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        }
    }

    fn upload_error(key: &StorageKey, message: impl Into<String>) -> StorageError {
        StorageError::Upload {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Single PUT streamed from disk
    async fn simple_upload(
        &self,
        key: &StorageKey,
        content_type: &str,
        source: &Path,
    ) -> Result<(), StorageError> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| Self::upload_error(key, e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| Self::upload_error(key, DisplayErrorContext(e).to_string()))?;

        Ok(())
    }

    /// Multipart upload for large files. Aborted on any part failure so no
    /// orphaned parts are left behind.
    async fn multipart_upload(
        &self,
        key: &StorageKey,
        content_type: &str,
        source: &Path,
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| Self::upload_error(key, DisplayErrorContext(e).to_string()))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| Self::upload_error(key, "no upload id in response"))?
            .to_string();

        match self.upload_parts(key, &upload_id, source).await {
            Ok(completed_parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key.as_str())
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| Self::upload_error(key, DisplayErrorContext(e).to_string()))?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key.as_str())
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &StorageKey,
        upload_id: &str,
        source: &Path,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let source_error = |e: std::io::Error| StorageError::Source {
            path: source.to_path_buf(),
            source: e,
        };

        let mut file = tokio::fs::File::open(source).await.map_err(source_error)?;
        let part_size = self.config.part_size_bytes;
        let mut completed_parts = Vec::new();
        let mut part_number = 1;

        loop {
            let mut chunk = Vec::with_capacity(part_size);
            let read = (&mut file)
                .take(part_size as u64)
                .read_to_end(&mut chunk)
                .await
                .map_err(source_error)?;
            if read == 0 {
                break;
            }

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key.as_str())
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| Self::upload_error(key, DisplayErrorContext(e).to_string()))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, source), fields(bucket = %self.bucket, key = %key))]
    async fn put(&self, key: &StorageKey, content_type: &str, source: &Path) -> Result<(), StorageError> {
        let size_bytes = tokio::fs::metadata(source)
            .await
            .map_err(|e| StorageError::Source {
                path: source.to_path_buf(),
                source: e,
            })?
            .len();

        debug!(size_bytes, "Uploading object to S3");

        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, content_type, source).await?;
        } else {
            self.simple_upload(key, content_type, source).await?;
        }

        info!(size_bytes, "Object uploaded successfully");

        Ok(())
    }

    #[instrument(skip(self), fields(ttl_secs = ttl.as_secs()))]
    async fn sign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<SignedUrl, StorageError> {
        let sign_error = |message: String| StorageError::Sign {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let signed_at = Utc::now();
        let presigning_config = PresigningConfig::builder()
            .start_time(SystemTime::from(signed_at))
            .expires_in(ttl)
            .build()
            .map_err(|e| sign_error(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| sign_error(DisplayErrorContext(e).to_string()))?;

        let ttl = chrono::Duration::from_std(ttl).map_err(|e| sign_error(e.to_string()))?;

        Ok(SignedUrl {
            url: presigned.uri().to_string(),
            signed_at,
            expires_at: signed_at + ttl,
        })
    }
}
