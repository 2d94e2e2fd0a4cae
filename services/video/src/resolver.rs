use crate::object_store::{ObjectStore, StorageError};
use crate::reference::{ReferenceError, StorageReference};
use crate::video_store::VideoRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A URL a client can fetch right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedUrl {
    pub url: String,
    /// Set for signed URLs; direct URLs do not expire
    pub expires_at: Option<DateTime<Utc>>,
}

/// Turns persisted references into client-usable URLs at read time.
///
/// Signed URLs are minted on every call and never cached or written back.
pub struct ReferenceResolver<S: ?Sized> {
    store: Arc<S>,
    ttl: Duration,
}

impl<S: ObjectStore + ?Sized> ReferenceResolver<S> {
    pub fn new(store: Arc<S>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, reference: &StorageReference) -> Result<ResolvedUrl, ResolveError> {
        match reference {
            StorageReference::Direct(url) => Ok(ResolvedUrl {
                url: url.clone(),
                expires_at: None,
            }),
            StorageReference::Composite { bucket, key } => {
                let signed = self.store.sign(bucket, key, self.ttl).await?;
                metrics::counter!("video.references.signed").increment(1);
                debug!(
                    signed_at = %signed.signed_at,
                    expires_at = %signed.expires_at,
                    "Signed storage reference"
                );
                Ok(ResolvedUrl {
                    url: signed.url,
                    expires_at: Some(signed.expires_at),
                })
            }
        }
    }

    /// Parse then resolve a persisted reference string.
    pub async fn resolve_str(&self, raw: &str) -> Result<ResolvedUrl, ResolveError> {
        let reference = StorageReference::parse(raw)?;
        self.resolve(&reference).await
    }

    /// Copy of `record` with its video reference replaced by a usable URL.
    /// Records without a video are returned unchanged.
    pub async fn resolve_record(&self, record: &VideoRecord) -> Result<VideoRecord, ResolveError> {
        let mut resolved = record.clone();
        if let Some(raw) = record.video_url.as_deref() {
            resolved.video_url = Some(self.resolve_str(raw).await?.url);
        }
        Ok(resolved)
    }
}
