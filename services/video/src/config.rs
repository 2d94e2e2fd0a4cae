use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Smallest part size S3 accepts for every part but the last.
const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Main configuration for the video service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// How stored references are handed back to clients
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Media tooling and staging configuration
    #[serde(default)]
    pub media: MediaConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Bearer token table for the static identity verifier
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for video storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Objects larger than this are sent as multipart uploads
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    /// Part size for multipart uploads in bytes
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Reference representation written after a successful upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Persist `bucket,key` and sign on every read
    #[default]
    Signed,
    /// Persist `<cdn_base_url>/<key>` and hand it out unchanged
    Cdn,
}

/// Delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub mode: DeliveryMode,
    /// Public distribution base URL, required in `cdn` mode
    pub cdn_base_url: Option<String>,
    /// Validity window of signed URLs in seconds
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
}

/// Media tooling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// ffprobe executable
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Directory for transient upload files (system temp dir when unset)
    pub staging_dir: Option<PathBuf>,
    /// Maximum accepted video size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Maximum distance from 16:9 / 9:16 still classified as that orientation
    #[serde(default = "default_aspect_tolerance")]
    pub aspect_tolerance: f64,
    /// Local directory thumbnails are written to and served from
    #[serde(default = "default_assets_root")]
    pub assets_root: PathBuf,
    /// Maximum accepted thumbnail size in bytes
    #[serde(default = "default_max_thumbnail_bytes")]
    pub max_thumbnail_bytes: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

impl DatabaseConfig {
    /// Pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Base URL clients use to reach this service (thumbnail links)
    pub public_base_url: Option<String>,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Static bearer tokens mapped to principal ids
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted bearer token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub principal: Uuid,
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

// Default value functions
fn default_service_name() -> String {
    "tubely-video".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_part_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_signed_url_ttl_secs() -> u64 {
    60
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_max_upload_bytes() -> u64 {
    1 << 30 // 1GB
}

fn default_aspect_tolerance() -> f64 {
    0.02
}

fn default_assets_root() -> PathBuf {
    PathBuf::from("./assets")
}

fn default_max_thumbnail_bytes() -> u64 {
    10 << 20 // 10MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8091
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "tubely-video")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/video").required(false))
            .add_source(config::File::with_name("/etc/tubely/video").required(false))
            // TUBELY__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("TUBELY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        if self.s3.part_size_bytes < MIN_PART_SIZE_BYTES {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.part_size_bytes".to_string(),
                message: format!("must be at least {} bytes", MIN_PART_SIZE_BYTES),
            });
        }

        if self.delivery.mode == DeliveryMode::Cdn
            && self
                .delivery
                .cdn_base_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
        {
            return Err(ConfigValidationError::MissingField(
                "delivery.cdn_base_url (required for cdn mode)".to_string(),
            ));
        }

        if self.delivery.signed_url_ttl_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "delivery.signed_url_ttl_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let tolerance = self.media.aspect_tolerance;
        if !tolerance.is_finite() || tolerance <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "media.aspect_tolerance".to_string(),
                message: format!("{} is not a positive number", tolerance),
            });
        }

        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        Ok(())
    }

    /// Get signed URL validity as Duration
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.delivery.signed_url_ttl_secs)
    }

    /// Base URL for links to locally served assets
    pub fn public_base_url(&self) -> String {
        match self.api.public_base_url.as_deref() {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.api.port),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::default(),
            cdn_base_url: None,
            signed_url_ttl_secs: default_signed_url_ttl_secs(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            ffmpeg_path: default_ffmpeg_path(),
            staging_dir: None,
            max_upload_bytes: default_max_upload_bytes(),
            aspect_tolerance: default_aspect_tolerance(),
            assets_root: default_assets_root(),
            max_thumbnail_bytes: default_max_thumbnail_bytes(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            public_base_url: None,
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
