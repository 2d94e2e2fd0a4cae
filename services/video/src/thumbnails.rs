use crate::asset_namer::AssetNamer;
use crate::pipeline::{accept_media_type, load_owned_video, PipelineError, UploadStage};
use crate::staging::{copy_limited, StagingError, TransientFile};
use crate::video_store::{VideoRecord, VideoRepository};
use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Image types accepted as thumbnails
pub const THUMBNAIL_MEDIA_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

/// Route prefix the assets directory is served under
pub const ASSETS_ROUTE: &str = "/assets";

/// Stores thumbnails on local disk and points the record at them
pub struct ThumbnailService {
    assets_root: PathBuf,
    public_base_url: String,
    max_bytes: u64,
    namer: AssetNamer,
    videos: Arc<dyn VideoRepository>,
}

impl ThumbnailService {
    pub fn new(
        assets_root: PathBuf,
        public_base_url: impl Into<String>,
        max_bytes: u64,
        videos: Arc<dyn VideoRepository>,
    ) -> Self {
        Self {
            assets_root,
            public_base_url: public_base_url.into(),
            max_bytes,
            namer: AssetNamer::new(),
            videos,
        }
    }

    pub fn assets_root(&self) -> &std::path::Path {
        &self.assets_root
    }

    fn public_url(&self, file_name: &str) -> String {
        format!(
            "{}{}/{}",
            self.public_base_url.trim_end_matches('/'),
            ASSETS_ROUTE,
            file_name
        )
    }

    /// Write the image and record its public URL. The file is removed again
    /// unless the record update succeeds.
    #[instrument(skip(self, body), fields(video_id = %video_id, principal = %principal))]
    pub async fn upload_thumbnail<S, E>(
        &self,
        principal: Uuid,
        video_id: Uuid,
        content_type: &str,
        body: S,
    ) -> Result<VideoRecord, PipelineError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: fmt::Display,
    {
        let media_type = accept_media_type(content_type, &THUMBNAIL_MEDIA_TYPES)?;
        load_owned_video(self.videos.as_ref(), principal, video_id).await?;

        let file_name = self.namer.file_name(media_type.as_str());
        let target = TransientFile::new(self.assets_root.join(&file_name));

        let mut file = tokio::fs::File::create(target.path())
            .await
            .map_err(|e| PipelineError::Staging(e.into()))?;
        let size_bytes = copy_limited(body, &mut file, self.max_bytes).await?;
        if size_bytes == 0 {
            return Err(PipelineError::Staging(StagingError::Empty));
        }
        file.sync_all()
            .await
            .map_err(|e| PipelineError::Staging(e.into()))?;
        drop(file);

        let record = self
            .videos
            .set_thumbnail_url(video_id, &self.public_url(&file_name))
            .await
            .map_err(|e| PipelineError::metadata(UploadStage::WritingReference, e))?;

        let path = target.keep();
        metrics::counter!("video.thumbnails.stored").increment(1);
        info!(path = %path.display(), size_bytes, "Thumbnail stored");

        Ok(record)
    }
}
