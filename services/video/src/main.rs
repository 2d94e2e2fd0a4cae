use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tubely_video::{
    start_api_server, AppState, Config, FastStartRemuxer, FfmpegTool, FfprobeTool, IdentityVerifier,
    MediaInspector, ObjectStore, PgVideoRepository, ProbeTool, ReferencePolicy, ReferenceResolver,
    RemuxTool, S3ObjectStore, Staging, StaticTokenVerifier, ThumbnailService, UploadPipeline,
    VideoRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        delivery_mode = ?config.delivery.mode,
        "Starting Tubely video service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    tokio::fs::create_dir_all(&config.media.assets_root)
        .await
        .with_context(|| format!("Failed to create assets directory {}", config.media.assets_root.display()))?;
    if let Some(dir) = &config.media.staging_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create staging directory {}", dir.display()))?;
    }

    // Initialize components
    let repository = PgVideoRepository::new(&config.database)
        .await
        .context("Failed to initialize video repository")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        repository
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }
    let videos: Arc<dyn VideoRepository> = Arc::new(repository);

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.s3).await);
    let probe: Arc<dyn ProbeTool> = Arc::new(FfprobeTool::new(config.media.ffprobe_path.clone()));
    let remux: Arc<dyn RemuxTool> = Arc::new(FfmpegTool::new(config.media.ffmpeg_path.clone()));

    let pipeline = UploadPipeline::new(
        Staging::new(config.media.staging_dir.clone(), config.media.max_upload_bytes),
        MediaInspector::new(probe, config.media.aspect_tolerance),
        FastStartRemuxer::new(remux),
        store.clone(),
        videos.clone(),
        ReferencePolicy::from_config(&config),
    );

    let thumbnails = ThumbnailService::new(
        config.media.assets_root.clone(),
        config.public_base_url(),
        config.media.max_thumbnail_bytes,
        videos.clone(),
    );

    let verifier: Arc<dyn IdentityVerifier> = Arc::new(StaticTokenVerifier::new(&config.auth));
    if config.auth.tokens.is_empty() {
        error!("No bearer tokens configured; every authenticated request will be rejected");
    }

    let state = AppState {
        pipeline: Arc::new(pipeline),
        thumbnails: Arc::new(thumbnails),
        resolver: Arc::new(ReferenceResolver::new(store, config.signed_url_ttl())),
        videos,
        verifier,
        max_upload_bytes: config.media.max_upload_bytes,
    };

    start_api_server(state, &config.api, shutdown_signal()).await?;

    info!("Video service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, shutting down");
        }
    }
}
