//! Video upload pipeline.
//!
//! One upload moves through `staged → inspected → remuxed → uploaded →
//! reference-written`. Any failure ends the request; nothing is retried
//! internally and the caller resubmits. Transient files are dropped as soon
//! as the object is uploaded and on every error path.

use crate::asset_namer::{AssetNamer, MediaType, MediaTypeError};
use crate::inspector::{InspectionError, MediaInspector, Orientation, ProbeTool};
use crate::key_builder::{build_key, KeyError, StorageKey};
use crate::object_store::{ObjectStore, StorageError};
use crate::reference::{ReferenceError, ReferencePolicy};
use crate::remux::{FastStartRemuxer, RemuxError, RemuxTool};
use crate::resolver::ResolveError;
use crate::staging::{Staging, StagingError};
use crate::video_store::{RepositoryError, VideoRecord, VideoRepository};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// The only media type accepted for video uploads.
pub const VIDEO_MEDIA_TYPE: &str = "video/mp4";

/// Step of a request at which something failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Validating,
    Authorizing,
    Staging,
    Inspecting,
    Remuxing,
    Uploading,
    WritingReference,
    Resolving,
}

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStage::Validating => "validating",
            UploadStage::Authorizing => "authorizing",
            UploadStage::Staging => "staging",
            UploadStage::Inspecting => "inspecting",
            UploadStage::Remuxing => "remuxing",
            UploadStage::Uploading => "uploading",
            UploadStage::WritingReference => "writing_reference",
            UploadStage::Resolving => "resolving",
        }
    }
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes callers act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputRejected,
    NotFound,
    AuthorizationFailed,
    InspectionFailed,
    ProcessingFailed,
    StorageFailed,
    MetadataFailed,
    InvalidReference,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid media type: {0}")]
    InvalidMediaType(#[from] MediaTypeError),

    #[error("Unsupported media type {found}: expected {allowed}")]
    UnsupportedMediaType { found: String, allowed: String },

    #[error("Video {0} not found")]
    VideoNotFound(Uuid),

    #[error("Principal {principal} does not own video {video_id}")]
    NotOwner { principal: Uuid, video_id: Uuid },

    #[error("Staging failed: {0}")]
    Staging(#[from] StagingError),

    #[error("Inspection failed: {0}")]
    Inspection(#[from] InspectionError),

    #[error("Processing failed: {0}")]
    Processing(#[from] RemuxError),

    #[error("Invalid storage key: {0}")]
    Key(#[from] KeyError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Metadata store failed while {stage}: {source}")]
    Metadata {
        stage: UploadStage,
        #[source]
        source: RepositoryError,
    },

    #[error("Reference resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}

impl PipelineError {
    pub fn metadata(stage: UploadStage, source: RepositoryError) -> Self {
        PipelineError::Metadata { stage, source }
    }

    pub fn stage(&self) -> UploadStage {
        match self {
            PipelineError::InvalidMediaType(_) | PipelineError::UnsupportedMediaType { .. } => {
                UploadStage::Validating
            }
            PipelineError::VideoNotFound(_) | PipelineError::NotOwner { .. } => UploadStage::Authorizing,
            PipelineError::Staging(_) => UploadStage::Staging,
            PipelineError::Inspection(_) => UploadStage::Inspecting,
            PipelineError::Processing(_) => UploadStage::Remuxing,
            PipelineError::Key(_) | PipelineError::Storage(_) => UploadStage::Uploading,
            PipelineError::Metadata { stage, .. } => *stage,
            PipelineError::Resolve(_) => UploadStage::Resolving,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidMediaType(_) | PipelineError::UnsupportedMediaType { .. } => {
                ErrorKind::InputRejected
            }
            PipelineError::Staging(e) if e.is_client_error() => ErrorKind::InputRejected,
            PipelineError::Staging(_) => ErrorKind::ProcessingFailed,
            PipelineError::VideoNotFound(_) => ErrorKind::NotFound,
            PipelineError::NotOwner { .. } => ErrorKind::AuthorizationFailed,
            PipelineError::Inspection(_) => ErrorKind::InspectionFailed,
            PipelineError::Processing(_) | PipelineError::Key(_) => ErrorKind::ProcessingFailed,
            PipelineError::Storage(_) => ErrorKind::StorageFailed,
            PipelineError::Metadata { .. } => ErrorKind::MetadataFailed,
            PipelineError::Resolve(ResolveError::Storage(_)) => ErrorKind::StorageFailed,
            PipelineError::Resolve(ResolveError::Reference(_)) => ErrorKind::InvalidReference,
        }
    }

    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InspectionFailed
                | ErrorKind::ProcessingFailed
                | ErrorKind::StorageFailed
                | ErrorKind::MetadataFailed
        )
    }
}

impl From<ReferenceError> for PipelineError {
    fn from(e: ReferenceError) -> Self {
        PipelineError::Resolve(ResolveError::Reference(e))
    }
}

/// Parse a declared content type and check it against an allow-list.
pub fn accept_media_type(declared: &str, allowed: &[&str]) -> Result<MediaType, PipelineError> {
    let media_type = MediaType::parse(declared)?;
    if !allowed.contains(&media_type.as_str()) {
        return Err(PipelineError::UnsupportedMediaType {
            found: media_type.to_string(),
            allowed: allowed.join(", "),
        });
    }
    Ok(media_type)
}

/// Load a video record and check that `principal` owns it.
pub async fn load_owned_video(
    videos: &dyn VideoRepository,
    principal: Uuid,
    video_id: Uuid,
) -> Result<VideoRecord, PipelineError> {
    let record = videos
        .get(video_id)
        .await
        .map_err(|e| PipelineError::metadata(UploadStage::Authorizing, e))?
        .ok_or(PipelineError::VideoNotFound(video_id))?;

    if record.user_id != principal {
        return Err(PipelineError::NotOwner { principal, video_id });
    }

    Ok(record)
}

/// Result of a completed upload. `record` holds the persisted reference,
/// not a client URL.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub record: VideoRecord,
    pub key: StorageKey,
    pub orientation: Orientation,
}

/// Orchestrates inspect → remux → upload → reference write for one request
pub struct UploadPipeline {
    staging: Staging,
    inspector: MediaInspector<dyn ProbeTool>,
    remuxer: FastStartRemuxer<dyn RemuxTool>,
    namer: AssetNamer,
    store: Arc<dyn ObjectStore>,
    videos: Arc<dyn VideoRepository>,
    policy: ReferencePolicy,
}

impl UploadPipeline {
    pub fn new(
        staging: Staging,
        inspector: MediaInspector<dyn ProbeTool>,
        remuxer: FastStartRemuxer<dyn RemuxTool>,
        store: Arc<dyn ObjectStore>,
        videos: Arc<dyn VideoRepository>,
        policy: ReferencePolicy,
    ) -> Self {
        Self {
            staging,
            inspector,
            remuxer,
            namer: AssetNamer::new(),
            store,
            videos,
            policy,
        }
    }

    /// Run one upload end to end.
    ///
    /// The media type and ownership are checked before any byte is staged.
    /// The record is written only after the object is stored.
    #[instrument(skip(self, body), fields(video_id = %video_id, principal = %principal))]
    pub async fn upload_video<S, E>(
        &self,
        principal: Uuid,
        video_id: Uuid,
        content_type: &str,
        body: S,
    ) -> Result<UploadOutcome, PipelineError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: fmt::Display,
    {
        let start = Instant::now();

        match self.run(principal, video_id, content_type, body).await {
            Ok(outcome) => {
                metrics::counter!("video.uploads.completed").increment(1);
                info!(
                    key = %outcome.key,
                    orientation = %outcome.orientation,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Video upload completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                let stage = e.stage();
                metrics::counter!("video.uploads.failed", "stage" => stage.as_str()).increment(1);
                warn!(
                    stage = %stage,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Video upload failed"
                );
                Err(e)
            }
        }
    }

    async fn run<S, E>(
        &self,
        principal: Uuid,
        video_id: Uuid,
        content_type: &str,
        body: S,
    ) -> Result<UploadOutcome, PipelineError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: fmt::Display,
    {
        let media_type = accept_media_type(content_type, &[VIDEO_MEDIA_TYPE])?;
        load_owned_video(self.videos.as_ref(), principal, video_id).await?;

        let asset = self.staging.stage(media_type, body).await?;
        let orientation = self.inspector.inspect(asset.path()).await?;
        let remuxed = self.remuxer.remux(asset.path()).await?;

        let file_name = self.namer.file_name(asset.media_type().as_str());
        let key = build_key(orientation, &file_name)?;

        let upload_start = Instant::now();
        self.store
            .put(&key, asset.media_type().as_str(), remuxed.path())
            .await?;
        metrics::histogram!("video.upload.duration_seconds").record(upload_start.elapsed().as_secs_f64());

        let size_bytes = asset.size_bytes();
        drop(remuxed);
        drop(asset);

        // Only video_url is written; concurrent thumbnail writes survive.
        let reference = self.policy.reference_for(&key).to_string();
        let record = self
            .videos
            .set_video_url(video_id, &reference)
            .await
            .map_err(|e| PipelineError::metadata(UploadStage::WritingReference, e))?;
        info!(key = %key, size_bytes, "Video reference written");

        Ok(UploadOutcome {
            record,
            key,
            orientation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::{MockProbeTool, ProbeReport, StreamGeometry};
    use crate::object_store::MockObjectStore;
    use crate::remux::MockRemuxTool;
    use crate::video_store::{MemoryVideoRepository, MockVideoRepository};
    use chrono::Utc;
    use futures::stream;
    use mockall::predicate::eq;
    use std::path::Path;
    use tempfile::TempDir;

    const BUCKET: &str = "tubely-videos";

    struct Harness {
        dir: TempDir,
        probe: MockProbeTool,
        remux: MockRemuxTool,
        store: MockObjectStore,
        videos: MockVideoRepository,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                probe: MockProbeTool::new(),
                remux: MockRemuxTool::new(),
                store: MockObjectStore::new(),
                videos: MockVideoRepository::new(),
            }
        }

        fn with_record(mut self, record: VideoRecord) -> Self {
            self.videos
                .expect_get()
                .with(eq(record.id))
                .returning(move |_| Ok(Some(record.clone())));
            self
        }

        fn probing(mut self, width: u32, height: u32) -> Self {
            self.probe.expect_probe().times(1).returning(move |_| {
                Ok(ProbeReport {
                    streams: vec![StreamGeometry { width, height }],
                })
            });
            self
        }

        fn remuxing(mut self, contents: &'static [u8]) -> Self {
            self.remux.expect_remux().times(1).returning(move |_, output| {
                std::fs::write(output, contents).unwrap();
                Ok(String::new())
            });
            self
        }

        fn build(mut self) -> (UploadPipeline, TempDir) {
            let videos: Arc<dyn VideoRepository> =
                Arc::new(std::mem::replace(&mut self.videos, MockVideoRepository::new()));
            self.build_with(videos)
        }

        fn build_with(self, videos: Arc<dyn VideoRepository>) -> (UploadPipeline, TempDir) {
            let staging = Staging::new(Some(self.dir.path().to_path_buf()), 1024 * 1024);
            let probe: Arc<dyn ProbeTool> = Arc::new(self.probe);
            let remux: Arc<dyn RemuxTool> = Arc::new(self.remux);
            let pipeline = UploadPipeline::new(
                staging,
                MediaInspector::new(probe, 0.02),
                FastStartRemuxer::new(remux),
                Arc::new(self.store),
                videos,
                ReferencePolicy::Signed {
                    bucket: BUCKET.to_string(),
                },
            );
            (pipeline, self.dir)
        }
    }

    fn record_owned_by(owner: Uuid) -> VideoRecord {
        VideoRecord {
            id: Uuid::new_v4(),
            user_id: owner,
            title: "Boots".to_string(),
            description: "Field test".to_string(),
            thumbnail_url: None,
            video_url: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn stored_with_video(owner: Uuid, video_id: Uuid, video_url: &str) -> VideoRecord {
        VideoRecord {
            id: video_id,
            video_url: Some(video_url.to_string()),
            ..record_owned_by(owner)
        }
    }

    fn video_body() -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        stream::iter(vec![
            Ok(Bytes::from_static(b"\x00\x00\x00\x18ftypmp42")),
            Ok(Bytes::from_static(b"mdat....moov....")),
        ])
    }

    fn leftover_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_landscape_upload_writes_reference() {
        let owner = Uuid::new_v4();
        let record = record_owned_by(owner);
        let video_id = record.id;

        let mut harness = Harness::new()
            .with_record(record)
            .probing(1920, 1080)
            .remuxing(b"moov....mdat....");
        harness
            .store
            .expect_put()
            .withf(|key, content_type, source| {
                key.as_str().starts_with("landscape/")
                    && key.as_str().ends_with(".mp4")
                    && content_type == "video/mp4"
                    && source.to_string_lossy().ends_with(".processing")
                    && std::fs::read(source).map(|b| b == b"moov....mdat....").unwrap_or(false)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .videos
            .expect_set_video_url()
            .withf(move |id, url| *id == video_id && url.starts_with("tubely-videos,landscape/"))
            .times(1)
            .returning(move |_, url| Ok(stored_with_video(owner, video_id, url)));

        let (pipeline, dir) = harness.build();
        let outcome = pipeline
            .upload_video(owner, video_id, "video/mp4", video_body())
            .await
            .unwrap();

        assert_eq!(outcome.orientation, Orientation::Landscape);
        assert!(outcome.key.as_str().starts_with("landscape/"));
        assert_eq!(
            outcome.record.video_url,
            Some(format!("{},{}", BUCKET, outcome.key))
        );
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_thumbnail_written_during_processing_survives() {
        let owner = Uuid::new_v4();
        let record = record_owned_by(owner);
        let video_id = record.id;
        let videos = Arc::new(MemoryVideoRepository::with_record(record));

        let mut harness = Harness::new().remuxing(b"moov");
        let concurrent = videos.clone();
        harness.probe.expect_probe().times(1).returning(move |_| {
            // Another request links a thumbnail while the video is being inspected.
            futures::executor::block_on(
                concurrent.set_thumbnail_url(video_id, "http://localhost:8091/assets/thumb.png"),
            )
            .unwrap();
            Ok(ProbeReport {
                streams: vec![StreamGeometry { width: 1920, height: 1080 }],
            })
        });
        harness.store.expect_put().times(1).returning(|_, _, _| Ok(()));

        let (pipeline, _dir) = harness.build_with(videos.clone());
        let outcome = pipeline
            .upload_video(owner, video_id, "video/mp4", video_body())
            .await
            .unwrap();

        let stored = videos.get(video_id).await.unwrap().unwrap();
        assert_eq!(
            stored.thumbnail_url.as_deref(),
            Some("http://localhost:8091/assets/thumb.png")
        );
        assert_eq!(stored.video_url, Some(format!("{},{}", BUCKET, outcome.key)));
        assert_eq!(outcome.record, stored);
    }

    #[tokio::test]
    async fn test_owner_mismatch_is_rejected_before_processing() {
        let record = record_owned_by(Uuid::new_v4());
        let video_id = record.id;

        let mut harness = Harness::new().with_record(record);
        harness.probe.expect_probe().times(0);
        harness.remux.expect_remux().times(0);
        harness.store.expect_put().times(0);
        harness.videos.expect_set_video_url().times(0);

        let (pipeline, dir) = harness.build();
        let err = pipeline
            .upload_video(Uuid::new_v4(), video_id, "video/mp4", video_body())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::NotOwner { .. }));
        assert_eq!(err.kind(), ErrorKind::AuthorizationFailed);
        assert!(!err.is_retryable());
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_video() {
        let mut harness = Harness::new();
        harness.videos.expect_get().returning(|_| Ok(None));

        let (pipeline, _dir) = harness.build();
        let err = pipeline
            .upload_video(Uuid::new_v4(), Uuid::new_v4(), "video/mp4", video_body())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::VideoNotFound(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_disallowed_media_type_fails_fast() {
        let mut harness = Harness::new();
        harness.videos.expect_get().times(0);
        harness.probe.expect_probe().times(0);

        let (pipeline, _dir) = harness.build();
        let err = pipeline
            .upload_video(Uuid::new_v4(), Uuid::new_v4(), "video/quicktime", video_body())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::UnsupportedMediaType { .. }));
        assert_eq!(err.kind(), ErrorKind::InputRejected);
        assert_eq!(err.stage(), UploadStage::Validating);
    }

    #[tokio::test]
    async fn test_media_type_parameters_are_ignored() {
        let owner = Uuid::new_v4();
        let record = record_owned_by(owner);
        let video_id = record.id;

        let mut harness = Harness::new()
            .with_record(record)
            .probing(1080, 1920)
            .remuxing(b"moov");
        harness
            .store
            .expect_put()
            .withf(|key, _, _| key.as_str().starts_with("portrait/"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        harness
            .videos
            .expect_set_video_url()
            .times(1)
            .returning(move |_, url| Ok(stored_with_video(owner, video_id, url)));

        let (pipeline, _dir) = harness.build();
        let outcome = pipeline
            .upload_video(owner, video_id, "Video/MP4; codecs=\"avc1\"", video_body())
            .await
            .unwrap();
        assert_eq!(outcome.orientation, Orientation::Portrait);
    }

    #[tokio::test]
    async fn test_zero_streams_aborts_before_remux() {
        let owner = Uuid::new_v4();
        let record = record_owned_by(owner);
        let video_id = record.id;

        let mut harness = Harness::new().with_record(record);
        harness
            .probe
            .expect_probe()
            .times(1)
            .returning(|_| Ok(ProbeReport::default()));
        harness.remux.expect_remux().times(0);
        harness.store.expect_put().times(0);
        harness.videos.expect_set_video_url().times(0);

        let (pipeline, dir) = harness.build();
        let err = pipeline
            .upload_video(owner, video_id, "video/mp4", video_body())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Inspection(InspectionError::NoStreams)));
        assert_eq!(err.stage(), UploadStage::Inspecting);
        assert!(err.is_retryable());
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_empty_remux_output_cleans_up_both_files() {
        let owner = Uuid::new_v4();
        let record = record_owned_by(owner);
        let video_id = record.id;

        let mut harness = Harness::new()
            .with_record(record)
            .probing(1920, 1080)
            .remuxing(b"");
        harness.store.expect_put().times(0);
        harness.videos.expect_set_video_url().times(0);

        let (pipeline, dir) = harness.build();
        let err = pipeline
            .upload_video(owner, video_id, "video/mp4", video_body())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Processing(RemuxError::EmptyOutput { .. })));
        assert_eq!(err.kind(), ErrorKind::ProcessingFailed);
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_writes_no_reference() {
        let owner = Uuid::new_v4();
        let record = record_owned_by(owner);
        let video_id = record.id;

        let mut harness = Harness::new()
            .with_record(record)
            .probing(640, 480)
            .remuxing(b"moov");
        harness.store.expect_put().times(1).returning(|key, _, _| {
            Err(StorageError::Upload {
                key: key.to_string(),
                message: "connection reset".to_string(),
            })
        });
        harness.videos.expect_set_video_url().times(0);

        let (pipeline, dir) = harness.build();
        let err = pipeline
            .upload_video(owner, video_id, "video/mp4", video_body())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Storage(_)));
        assert_eq!(err.kind(), ErrorKind::StorageFailed);
        assert!(err.is_retryable());
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_metadata_write_failure_reports_stage() {
        let owner = Uuid::new_v4();
        let record = record_owned_by(owner);
        let video_id = record.id;

        let mut harness = Harness::new()
            .with_record(record)
            .probing(1920, 1080)
            .remuxing(b"moov");
        harness.store.expect_put().times(1).returning(|_, _, _| Ok(()));
        harness
            .videos
            .expect_set_video_url()
            .times(1)
            .returning(|id, _| Err(RepositoryError::Vanished(id)));

        let (pipeline, _dir) = harness.build();
        let err = pipeline
            .upload_video(owner, video_id, "video/mp4", video_body())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), UploadStage::WritingReference);
        assert_eq!(err.kind(), ErrorKind::MetadataFailed);
    }

    #[test]
    fn test_accept_media_type() {
        assert_eq!(
            accept_media_type("image/png", &["image/jpeg", "image/png"])
                .unwrap()
                .as_str(),
            "image/png"
        );
        let err = accept_media_type("image/gif", &["image/jpeg", "image/png"]).unwrap_err();
        assert!(err.to_string().contains("image/jpeg, image/png"));
        assert!(matches!(
            accept_media_type("", &[VIDEO_MEDIA_TYPE]),
            Err(PipelineError::InvalidMediaType(_))
        ));
    }

    #[test]
    fn test_resolve_errors_classification() {
        let malformed: PipelineError = ReferenceError::Malformed("a".to_string()).into();
        assert_eq!(malformed.kind(), ErrorKind::InvalidReference);
        assert!(!malformed.is_retryable());

        let signing = PipelineError::Resolve(ResolveError::Storage(StorageError::Sign {
            bucket: BUCKET.to_string(),
            key: "k".to_string(),
            message: "denied".to_string(),
        }));
        assert_eq!(signing.kind(), ErrorKind::StorageFailed);
        assert_eq!(signing.stage(), UploadStage::Resolving);
    }
}
