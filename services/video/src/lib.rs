//! Tubely Video Service
//!
//! Ingestion and placement service for user-submitted videos. An upload is
//! staged to local disk, inspected for its aspect ratio, remuxed so the
//! playback index sits at the front of the file, stored in S3 under an
//! orientation prefix, and linked from its metadata record. Readers get a
//! short-lived signed URL (or a direct CDN URL) minted on every read.
//!
//! ## Features
//!
//! - **Orientation placement**: `landscape/`, `portrait/` or `other/` key
//!   prefixes from the first stream's geometry
//! - **Fast-start remux**: stream-copy remux, no re-encoding
//! - **Signed delivery**: `bucket,key` references signed at read time, never
//!   cached or persisted
//! - **Guaranteed cleanup**: every transient file is owned by a drop guard
//!
//! ## Architecture
//!
//! ```text
//!  HTTP multipart           Local disk                S3 Bucket
//! ┌──────────────┐        ┌──────────────┐        ┌──────────────┐
//! │ Upload API   │───────▶│ Staging      │        │ landscape/   │
//! └──────────────┘        └──────────────┘        │ portrait/    │
//!        │                       │                │ other/       │
//!        │                       ▼                └──────────────┘
//!        │                ┌──────────────┐               ▲
//!        │                │ Inspector    │ ffprobe       │
//!        │                └──────────────┘               │
//!        │                       │                       │
//!        │                       ▼                       │
//!        │                ┌──────────────┐        ┌──────────────┐
//!        │                │ Remuxer      │───────▶│ Object Store │
//!        │                └──────────────┘ ffmpeg └──────────────┘
//!        │                                               │
//!        ▼                                               ▼
//! ┌──────────────┐        ┌──────────────┐        ┌──────────────┐
//! │ Reference    │◀───────│ PostgreSQL   │◀───────│ Reference    │
//! │ Resolver     │  read  │ videos       │ write  │ Policy       │
//! └──────────────┘        └──────────────┘        └──────────────┘
//! ```

pub mod api;
pub mod asset_namer;
pub mod config;
pub mod identity;
pub mod inspector;
pub mod key_builder;
pub mod object_store;
pub mod pipeline;
pub mod reference;
pub mod remux;
pub mod resolver;
pub mod staging;
pub mod thumbnails;
pub mod video_store;

pub use api::{create_router, start_api_server, AppState, ErrorResponse};
pub use asset_namer::{AssetNamer, MediaType};
pub use config::Config;
pub use identity::{IdentityVerifier, StaticTokenVerifier};
pub use inspector::{FfprobeTool, MediaInspector, Orientation, ProbeTool};
pub use key_builder::{build_key, StorageKey};
pub use object_store::{ObjectStore, S3ObjectStore, SignedUrl};
pub use pipeline::{ErrorKind, PipelineError, UploadOutcome, UploadPipeline, UploadStage};
pub use reference::{ReferencePolicy, StorageReference};
pub use remux::{FastStartRemuxer, FfmpegTool, RemuxTool};
pub use resolver::{ReferenceResolver, ResolvedUrl};
pub use staging::{MediaAsset, Staging, TransientFile};
pub use thumbnails::ThumbnailService;
pub use video_store::{PgVideoRepository, VideoRecord, VideoRepository};
