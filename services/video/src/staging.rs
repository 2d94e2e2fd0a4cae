//! Transient local files owned by a single upload.
//!
//! Every file an upload creates is held by a guard that deletes it on drop,
//! so cleanup runs on success, on error and when the request future is
//! cancelled.

use crate::asset_namer::MediaType;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Failed to read upload body: {0}")]
    Body(String),

    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("Upload body is empty")]
    Empty,

    #[error("Failed to write transient file: {0}")]
    Io(#[from] std::io::Error),
}

impl StagingError {
    /// Whether the failure came from the request rather than this host.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, StagingError::Io(_))
    }
}

/// A file removed from disk when the guard is dropped
#[derive(Debug)]
pub struct TransientFile {
    path: Option<PathBuf>,
}

impl TransientFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Disarm the guard and leave the file in place.
    pub fn keep(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed transient file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove transient file"),
        }
    }
}

/// An uploaded file staged on local disk for the duration of one request
pub struct MediaAsset {
    path: TempPath,
    media_type: MediaType,
    size_bytes: u64,
}

impl MediaAsset {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl fmt::Debug for MediaAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaAsset")
            .field("path", &self.path.display())
            .field("media_type", &self.media_type)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

/// Writes request bodies to uniquely named files in the staging directory
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
    max_bytes: u64,
}

impl Staging {
    pub fn new(dir: Option<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.unwrap_or_else(std::env::temp_dir),
            max_bytes,
        }
    }

    /// Stream `body` into a new transient file.
    pub async fn stage<S, E>(&self, media_type: MediaType, body: S) -> Result<MediaAsset, StagingError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let temp = tempfile::Builder::new()
            .prefix("tubely-upload-")
            .suffix(".mp4")
            .tempfile_in(&self.dir)?;
        let (file, path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let size_bytes = copy_limited(body, &mut file, self.max_bytes).await?;
        if size_bytes == 0 {
            return Err(StagingError::Empty);
        }
        file.sync_all().await?;

        debug!(path = %path.display(), size_bytes, "Upload staged");

        Ok(MediaAsset {
            path,
            media_type,
            size_bytes,
        })
    }
}

/// Copy a byte stream into `writer`, failing once more than `limit` bytes arrive.
pub async fn copy_limited<S, E, W>(body: S, writer: &mut W, limit: u64) -> Result<u64, StagingError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
    W: tokio::io::AsyncWrite + Unpin,
{
    tokio::pin!(body);

    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| StagingError::Body(e.to_string()))?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(StagingError::TooLarge { limit });
        }
        writer.write_all(&chunk).await?;
    }
    writer.flush().await?;

    Ok(written)
}
