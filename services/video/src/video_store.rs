use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Video {0} no longer exists")]
    Vanished(Uuid),
}

/// Video metadata record. Created and deleted elsewhere; this service reads
/// the owner and writes the media reference fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct VideoRecord {
    pub id: Uuid,
    /// Owning principal
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    pub thumbnail_url: Option<String>,
    /// Persisted storage reference, see [`crate::reference::StorageReference`]
    pub video_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata collaborator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VideoRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<VideoRecord>, RepositoryError>;

    /// Point the record at a stored video. Only `video_url` is written.
    async fn set_video_url(&self, id: Uuid, video_url: &str) -> Result<VideoRecord, RepositoryError>;

    /// Point the record at a thumbnail. Only `thumbnail_url` is written.
    async fn set_thumbnail_url(&self, id: Uuid, thumbnail_url: &str) -> Result<VideoRecord, RepositoryError>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> Result<(), RepositoryError>;
}

/// PostgreSQL-backed video repository
pub struct PgVideoRepository {
    pool: PgPool,
}

impl PgVideoRepository {
    /// Create a new repository with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), RepositoryError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl VideoRepository for PgVideoRepository {
    async fn get(&self, id: Uuid) -> Result<Option<VideoRecord>, RepositoryError> {
        let record = sqlx::query_as::<_, VideoRecord>(
            r#"
            SELECT id, user_id, title, description, thumbnail_url,
                   video_url, created_at, updated_at
            FROM videos
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn set_video_url(&self, id: Uuid, video_url: &str) -> Result<VideoRecord, RepositoryError> {
        let record = sqlx::query_as::<_, VideoRecord>(
            r#"
            UPDATE videos
            SET video_url = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, title, description, thumbnail_url,
                      video_url, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(video_url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepositoryError::Vanished(id))?;

        debug!("Video reference updated");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn set_thumbnail_url(&self, id: Uuid, thumbnail_url: &str) -> Result<VideoRecord, RepositoryError> {
        let record = sqlx::query_as::<_, VideoRecord>(
            r#"
            UPDATE videos
            SET thumbnail_url = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, title, description, thumbnail_url,
                      video_url, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(thumbnail_url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepositoryError::Vanished(id))?;

        debug!("Thumbnail reference updated");
        Ok(record)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

/// In-memory repository whose setters touch one column each, like the SQL
/// above. Lets tests interleave writers.
#[cfg(test)]
pub(crate) struct MemoryVideoRepository {
    records: std::sync::Mutex<std::collections::HashMap<Uuid, VideoRecord>>,
}

#[cfg(test)]
impl MemoryVideoRepository {
    pub(crate) fn with_record(record: VideoRecord) -> Self {
        let mut records = std::collections::HashMap::new();
        records.insert(record.id, record);
        Self {
            records: std::sync::Mutex::new(records),
        }
    }

    fn modify(&self, id: Uuid, apply: impl FnOnce(&mut VideoRecord)) -> Result<VideoRecord, RepositoryError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id).ok_or(RepositoryError::Vanished(id))?;
        apply(record);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}

#[cfg(test)]
#[async_trait]
impl VideoRepository for MemoryVideoRepository {
    async fn get(&self, id: Uuid) -> Result<Option<VideoRecord>, RepositoryError> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn set_video_url(&self, id: Uuid, video_url: &str) -> Result<VideoRecord, RepositoryError> {
        self.modify(id, |record| record.video_url = Some(video_url.to_string()))
    }

    async fn set_thumbnail_url(&self, id: Uuid, thumbnail_url: &str) -> Result<VideoRecord, RepositoryError> {
        self.modify(id, |record| record.thumbnail_url = Some(thumbnail_url.to_string()))
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
