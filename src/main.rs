use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use ytdl_server::{
    ApiError, AppConfig, DownloadService, ProgressTable,
    cache::{CACHE_PURGE_INTERVAL, TtlCache},
    extractor::YtDlpMetadataSource,
    retention::{spawn_sweeper, sweep},
    routes::{AppState, build_router},
    stream::HttpStreamSource,
    transcode::FfmpegTranscoder,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytdl_server=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "could not create downloads directory {:?}: {error}",
                config.downloads_dir
            ))
        })?;

    let streams = HttpStreamSource::new(&config.upstream)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    let cache = TtlCache::new(config.metadata_ttl);
    let progress = ProgressTable::new(config.progress_retention, config.progress_capacity);

    let service = DownloadService::new(
        Arc::new(YtDlpMetadataSource::new(&config.yt_dlp_path)),
        Arc::new(streams),
        Arc::new(FfmpegTranscoder::new(&config.ffmpeg_path)),
        cache.clone(),
        progress.clone(),
        &config.downloads_dir,
        config.max_concurrent_downloads,
    );

    let startup = sweep(&config.downloads_dir, config.file_max_age).await;
    if startup.removed > 0 || startup.failed > 0 {
        warn!(
            removed = startup.removed,
            failed = startup.failed,
            "startup sweep found leftover downloads"
        );
    }

    spawn_sweeper(
        config.downloads_dir.clone(),
        config.sweep_interval,
        config.file_max_age,
        progress,
    );
    spawn_cache_purge(cache);

    if config.allowed_origins.is_empty() {
        warn!("ALLOWED_ORIGINS is not set; accepting requests from any origin.");
    }

    let state = AppState {
        service,
        file_delete_delay: config.file_delete_delay,
        file_max_age: config.file_max_age,
    };
    let app = build_router(state, &config.allowed_origins);

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("could not bind {}: {error}", config.bind_addr))
    })?;

    info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        file_max_age_secs = config.file_max_age.as_secs(),
        downloads_dir = ?config.downloads_dir,
        "server ready on http://{}",
        config.bind_addr
    );

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn spawn_cache_purge<V>(cache: TtlCache<V>)
where
    V: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = cache.purge_expired().await;
            if purged > 0 {
                debug!(purged, "expired metadata cache entries dropped");
            }
        }
    });
}
