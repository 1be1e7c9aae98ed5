use std::{
    cmp::Reverse,
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as UrlPath, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::normalize_origin,
    error::{ApiError, JobError},
    jobs::{DownloadService, JobRequest, SupportedFormats, supported_formats},
    media::{Author, StreamVariant, VideoMetadata, format_duration},
    progress::{ProgressRecord, ProgressStatus},
    retention::remove_file_if_present,
};

const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";
const FILE_GONE: &str = "File not found or expired";
const MAX_LISTED_VIDEO_VARIANTS: usize = 10;
const MAX_LISTED_AUDIO_VARIANTS: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub service: DownloadService,
    pub file_delete_delay: Duration,
    pub file_max_age: Duration,
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: String,
    format: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    success: bool,
    download_id: Uuid,
    download_url: String,
    expires_in: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfoResponse {
    pub id: String,
    pub title: String,
    pub duration: String,
    pub duration_seconds: u64,
    pub thumbnail: Option<String>,
    pub author: Author,
    pub qualities: Vec<String>,
    pub formats: VariantLists,
}

#[derive(Debug, Serialize)]
pub struct VariantLists {
    pub video: Vec<StreamVariant>,
    pub audio: Vec<StreamVariant>,
}

impl From<VideoMetadata> for VideoInfoResponse {
    fn from(metadata: VideoMetadata) -> Self {
        let mut video: Vec<StreamVariant> = metadata
            .variants
            .iter()
            .filter(|variant| variant.has_video && variant.has_audio)
            .cloned()
            .collect();
        video.sort_by_key(|variant| Reverse(variant.height.unwrap_or_default()));

        let mut audio: Vec<StreamVariant> = metadata
            .variants
            .iter()
            .filter(|variant| variant.has_audio && !variant.has_video)
            .cloned()
            .collect();
        audio.sort_by(|a, b| {
            let a = a.audio_bitrate_kbps.unwrap_or_default();
            let b = b.audio_bitrate_kbps.unwrap_or_default();
            b.total_cmp(&a)
        });

        let mut seen = HashSet::new();
        let qualities = video
            .iter()
            .filter_map(|variant| variant.quality_label.clone())
            .filter(|label| seen.insert(label.clone()))
            .collect();

        video.truncate(MAX_LISTED_VIDEO_VARIANTS);
        audio.truncate(MAX_LISTED_AUDIO_VARIANTS);

        Self {
            id: metadata.id,
            title: metadata.title,
            duration: format_duration(metadata.duration_seconds),
            duration_seconds: metadata.duration_seconds,
            thumbnail: metadata.thumbnail_url,
            author: metadata.author,
            qualities,
            formats: VariantLists { video, audio },
        }
    }
}

pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(video_info))
        .route("/api/download", post(start_download))
        .route("/api/progress/{id}", get(download_progress))
        .route("/api/file/{id}", get(download_file))
        .route("/api/formats", get(formats))
        .fallback(route_not_found)
        .with_state(state)
        .layer(build_cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "OK",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn formats() -> Json<SupportedFormats> {
    Json(supported_formats())
}

async fn route_not_found() -> ApiError {
    ApiError::not_found("Route not found")
}

async fn video_info(
    State(state): State<AppState>,
    Json(payload): Json<InfoRequest>,
) -> Result<Json<VideoInfoResponse>, ApiError> {
    let metadata = state.service.video_info(&payload.url).await?;
    Ok(Json(metadata.into()))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let handle = state.service.start_job(JobRequest {
        url: payload.url,
        format: payload.format,
        quality: payload.quality,
    })?;
    let id = handle.id();

    Ok(Json(DownloadResponse {
        success: true,
        download_id: id,
        download_url: format!("/api/file/{id}"),
        expires_in: format!("{} minutes", state.file_max_age.as_secs() / 60),
    }))
}

async fn download_progress(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    let record = Uuid::parse_str(&id)
        .ok()
        .and_then(|id| state.service.progress(&id));

    match record {
        Some(record) => Json(record).into_response(),
        None => Json(serde_json::json!({ "status": ProgressStatus::Unknown })).into_response(),
    }
}

async fn download_file(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| JobError::not_found(FILE_GONE))?;
    let record = state.service.progress(&id);
    if let Some(record) = &record
        && record.status != ProgressStatus::Completed
    {
        return Err(JobError::not_found("File is not ready yet").into());
    }

    let path = find_output_file(state.service.output_dir(), &id)
        .await
        .ok_or_else(|| JobError::not_found(FILE_GONE))?;
    let filename = download_filename(record.as_ref(), &path);

    let file = tokio::fs::File::open(&path).await.map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            ApiError::from(JobError::not_found(FILE_GONE))
        } else {
            ApiError::internal(format!("could not open download: {error}"))
        }
    })?;
    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("could not read download metadata: {error}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("could not build download header"))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(&filename))
            .map_err(|_| ApiError::internal("could not build download header"))?,
    );

    info!(job_id = %id, filename = %filename, bytes = metadata.len(), "serving download");
    schedule_file_removal(path, state.file_delete_delay);

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

async fn find_output_file(dir: &Path, id: &Uuid) -> Option<PathBuf> {
    let prefix = id.to_string();
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix));
        if matches {
            return Some(entry.path());
        }
    }

    None
}

fn download_filename(record: Option<&ProgressRecord>, path: &Path) -> String {
    record
        .and_then(|record| record.filename.clone())
        .or_else(|| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| "download.bin".to_string())
}

// Open handles keep streaming after unlink, so the delay only has to cover the
// time until the response body opened the file.
fn schedule_file_removal(path: PathBuf, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        debug!("removing served download {:?}", path);
        remove_file_if_present(&path).await;
    });
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]);

    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let allowed: HashSet<String> = allowed_origins.iter().cloned().collect();
    info!("CORS allow-list loaded with {} origin(s): {:?}", allowed.len(), allowed);
    layer.allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        origin
            .to_str()
            .ok()
            .and_then(normalize_origin)
            .is_some_and(|value| allowed.contains(&value))
    }))
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{DEFAULT_METADATA_TTL, TtlCache},
        extractor::MetadataSource,
        progress::{DEFAULT_PROGRESS_CAPACITY, DEFAULT_PROGRESS_RETENTION, ProgressTable},
        stream::{ByteStream, OpenedStream, StreamSource},
        transcode::{ProgressCallback, TranscodeRequest, Transcoder},
    };
    use async_trait::async_trait;
    use axum::{
        body::to_bytes,
        http::{Request, StatusCode},
    };
    use bytes::Bytes;
    use futures_util::{StreamExt, stream};
    use std::{collections::HashMap, sync::Arc};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct StaticMetadata;

    #[async_trait]
    impl MetadataSource for StaticMetadata {
        async fn fetch_metadata(&self, _url: &str) -> Result<VideoMetadata, JobError> {
            let variant = |id: &str, has_video: bool, height: Option<u32>, abr: Option<f32>| {
                StreamVariant {
                    format_id: id.to_string(),
                    url: format!("https://media.example/{id}"),
                    http_headers: HashMap::new(),
                    has_video,
                    has_audio: true,
                    height,
                    audio_bitrate_kbps: abr,
                    container: if has_video { "mp4" } else { "m4a" }.to_string(),
                    content_length: None,
                    quality_label: height.map(|value| format!("{value}p")),
                }
            };

            Ok(VideoMetadata {
                id: "dQw4w9WgXcQ".to_string(),
                title: "Café: Live".to_string(),
                duration_seconds: 212,
                thumbnail_url: Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg".to_string()),
                author: Author {
                    name: "Rick Astley".to_string(),
                    channel_url: None,
                },
                variants: vec![
                    variant("18", true, Some(360), None),
                    variant("22", true, Some(720), None),
                    variant("139", false, None, Some(48.0)),
                    variant("140", false, None, Some(128.0)),
                ],
            })
        }
    }

    struct StaticStream;

    #[async_trait]
    impl StreamSource for StaticStream {
        async fn open_stream(&self, _variant: &StreamVariant) -> Result<OpenedStream, JobError> {
            Ok(OpenedStream {
                total_bytes: Some(4),
                body: stream::iter(vec![Ok(Bytes::from_static(b"data"))]).boxed(),
            })
        }
    }

    struct NoTranscoder;

    #[async_trait]
    impl Transcoder for NoTranscoder {
        async fn transcode(
            &self,
            _input: ByteStream,
            _request: TranscodeRequest,
            _on_progress: ProgressCallback,
        ) -> Result<(), JobError> {
            Err(JobError::Transcode("not available in tests".to_string()))
        }
    }

    fn app(dir: &TempDir) -> Router {
        let service = DownloadService::new(
            Arc::new(StaticMetadata),
            Arc::new(StaticStream),
            Arc::new(NoTranscoder),
            TtlCache::new(DEFAULT_METADATA_TTL),
            ProgressTable::new(DEFAULT_PROGRESS_RETENTION, DEFAULT_PROGRESS_CAPACITY),
            dir.path(),
            2,
        );
        let state = AppState {
            service,
            file_delete_delay: Duration::from_millis(20),
            file_max_age: Duration::from_secs(60 * 60),
        };
        build_router(state, &[])
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn json(body: &Bytes) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = TempDir::new().unwrap();
        let (status, _, body) = send(&app(&dir), get("/api/health")).await;

        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["status"], "OK");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn formats_lists_outputs() {
        let dir = TempDir::new().unwrap();
        let (status, _, body) = send(&app(&dir), get("/api/formats")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["video"][0], "360p");
    }

    #[tokio::test]
    async fn info_returns_sorted_view() {
        let dir = TempDir::new().unwrap();
        let request = post_json("/api/info", serde_json::json!({"url": "youtu.be/dQw4w9WgXcQ"}));
        let (status, _, body) = send(&app(&dir), request).await;

        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["duration"], "3:32");
        assert_eq!(body["durationSeconds"], 212);
        assert_eq!(body["qualities"], serde_json::json!(["720p", "360p"]));
        assert_eq!(body["formats"]["audio"][0]["formatId"], "140");
        assert!(body["formats"]["video"][0].get("url").is_none());
    }

    #[tokio::test]
    async fn info_rejects_missing_url() {
        let dir = TempDir::new().unwrap();
        let request = post_json("/api/info", serde_json::json!({}));
        let (status, _, body) = send(&app(&dir), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["error"], "URL is required");
    }

    #[tokio::test]
    async fn download_rejects_unknown_format() {
        let dir = TempDir::new().unwrap();
        let request = post_json(
            "/api/download",
            serde_json::json!({"url": "https://youtu.be/dQw4w9WgXcQ", "format": "avi"}),
        );
        let (status, _, body) = send(&app(&dir), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json(&body)["error"].as_str().unwrap().contains("Invalid format"));
    }

    #[tokio::test]
    async fn download_then_poll_then_fetch_file() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let request = post_json(
            "/api/download",
            serde_json::json!({"url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ"}),
        );
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["success"], true);
        assert_eq!(body["expiresIn"], "60 minutes");
        let id = body["downloadId"].as_str().unwrap().to_string();
        assert_eq!(body["downloadUrl"], format!("/api/file/{id}"));

        let mut progress = serde_json::Value::Null;
        for _ in 0..100 {
            let (_, _, body) = send(&app, get(&format!("/api/progress/{id}"))).await;
            progress = json(&body);
            if progress["status"] == "completed" || progress["status"] == "error" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(progress["status"], "completed");
        assert_eq!(progress["progress"], 100);
        assert_eq!(progress["filename"], "Café Live.mp4");

        let (status, headers, body) = send(&app, get(&format!("/api/file/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"data");
        assert_eq!(headers[CONTENT_TYPE], "video/mp4");
        let disposition = headers[CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.contains("filename=\"Caf_ Live.mp4\""));
        assert!(disposition.contains("filename*=UTF-8''Caf%C3%A9%20Live.mp4"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (status, _, _) = send(&app, get(&format!("/api/file/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_progress_is_reported_as_unknown() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let uris = [
            format!("/api/progress/{}", Uuid::new_v4()),
            "/api/progress/not-a-uuid".to_string(),
        ];
        for uri in uris {
            let (status, _, body) = send(&app, get(&uri)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json(&body), serde_json::json!({"status": "unknown"}));
        }
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let uri = format!("/api/file/{}", Uuid::new_v4());
        let (status, _, body) = send(&app(&dir), get(&uri)).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        let body = json(&body);
        assert_eq!(body["error"], "File not found or expired");
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn unknown_route_is_json_not_found() {
        let dir = TempDir::new().unwrap();
        let (status, _, body) = send(&app(&dir), get("/api/nope")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["code"], "NOT_FOUND");
    }

    #[test]
    fn sanitizes_ascii_filenames() {
        assert_eq!(sanitize_ascii_filename("Café: Live.mp3"), "Caf__ Live.mp3");
        assert_eq!(sanitize_ascii_filename("   "), "download.bin");
        assert_eq!(content_type_for_filename("clip.M4A"), "audio/mp4");
        assert_eq!(content_type_for_filename("clip"), "application/octet-stream");
    }
}
