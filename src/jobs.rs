use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    sync::Semaphore,
    task::JoinHandle,
    time::Duration,
};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    cache::TtlCache,
    config::non_empty,
    error::JobError,
    extractor::MetadataSource,
    format_selector::select_variant,
    media::{OutputFormat, SUPPORTED_FORMATS, VideoMetadata, sanitize_title},
    progress::{ProgressRecord, ProgressTable, ProgressWriter},
    stream::{ByteStream, StreamSource},
    transcode::{TranscodeRequest, Transcoder},
};

// Subdomains (www, m, music) match through the suffix check.
const SUPPORTED_HOSTS: [&str; 2] = ["youtube.com", "youtu.be"];

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub url: String,
    pub format: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    pub format: OutputFormat,
    pub quality: Option<String>,
    pub output_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedDownload {
    pub filename: String,
    pub path: PathBuf,
}

/// Returned as soon as a job is accepted. Dropping it detaches the task.
pub struct JobHandle {
    pub job: Job,
    task: JoinHandle<Result<CompletedDownload, JobError>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.job.id
    }

    pub async fn wait(self) -> Result<CompletedDownload, JobError> {
        self.task
            .await
            .map_err(|error| JobError::Stream(format!("download task aborted: {error}")))?
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SupportedFormats {
    pub video: Vec<&'static str>,
    pub audio: Vec<&'static str>,
    pub formats: Vec<&'static str>,
}

pub fn supported_formats() -> SupportedFormats {
    SupportedFormats {
        video: vec!["360p", "480p", "720p", "1080p"],
        audio: vec!["MP3", "M4A"],
        formats: SUPPORTED_FORMATS.iter().map(|format| format.extension()).collect(),
    }
}

#[derive(Clone)]
pub struct DownloadService {
    metadata: Arc<dyn MetadataSource>,
    streams: Arc<dyn StreamSource>,
    transcoder: Arc<dyn Transcoder>,
    cache: TtlCache<VideoMetadata>,
    progress: ProgressTable,
    output_dir: PathBuf,
    download_slots: Arc<Semaphore>,
}

impl DownloadService {
    pub fn new(
        metadata: Arc<dyn MetadataSource>,
        streams: Arc<dyn StreamSource>,
        transcoder: Arc<dyn Transcoder>,
        cache: TtlCache<VideoMetadata>,
        progress: ProgressTable,
        output_dir: impl Into<PathBuf>,
        max_concurrent_downloads: usize,
    ) -> Self {
        Self {
            metadata,
            streams,
            transcoder,
            cache,
            progress,
            output_dir: output_dir.into(),
            download_slots: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn progress_table(&self) -> &ProgressTable {
        &self.progress
    }

    pub fn progress(&self, id: &Uuid) -> Option<ProgressRecord> {
        self.progress.get(id)
    }

    pub async fn video_info(&self, url: &str) -> Result<VideoMetadata, JobError> {
        let url = normalize_video_url(url)?;
        self.cached_metadata(&url).await
    }

    async fn cached_metadata(&self, url: &str) -> Result<VideoMetadata, JobError> {
        if let Some(metadata) = self.cache.get(url).await {
            debug!(url, "metadata cache hit");
            return Ok(metadata);
        }

        let metadata = self.metadata.fetch_metadata(url).await?;
        self.cache.set_default(url, metadata.clone()).await;
        Ok(metadata)
    }

    /// Only validation errors are returned here; later failures land in the
    /// progress record.
    pub fn start_job(&self, request: JobRequest) -> Result<JobHandle, JobError> {
        let url = normalize_video_url(&request.url)?;
        let format = match request.format.as_deref().and_then(non_empty) {
            Some(value) => value.parse::<OutputFormat>()?,
            None => OutputFormat::Mp4,
        };

        let id = Uuid::new_v4();
        let job = Job {
            id,
            url,
            format,
            quality: request.quality.as_deref().and_then(non_empty).map(ToString::to_string),
            output_path: self.output_dir.join(format!("{id}.{}", format.extension())),
            created_at: Utc::now(),
        };

        let writer = self.progress.register(id);
        info!(job_id = %id, url = %job.url, format = %job.format, "download job accepted");

        let service = self.clone();
        let spawned = job.clone();
        let task = tokio::spawn(async move { service.run_job(spawned, writer).await });

        Ok(JobHandle { job, task })
    }

    async fn run_job(
        &self,
        job: Job,
        writer: ProgressWriter,
    ) -> Result<CompletedDownload, JobError> {
        let result = match self.download_slots.clone().acquire_owned().await {
            Ok(_permit) => self.execute(&job, &writer).await,
            Err(_) => Err(JobError::Stream("download queue is closed".to_string())),
        };

        match &result {
            Ok(done) => {
                writer.complete(done.filename.clone());
                info!(job_id = %job.id, filename = %done.filename, "download job completed");
            }
            Err(failure) => {
                writer.fail(failure.to_string());
                error!(job_id = %job.id, "download job failed: {failure}");
            }
        }

        result
    }

    async fn execute(
        &self,
        job: &Job,
        writer: &ProgressWriter,
    ) -> Result<CompletedDownload, JobError> {
        let metadata = self.cached_metadata(&job.url).await?;
        let variant = select_variant(
            job.format.kind(),
            &metadata.variants,
            job.quality.as_deref(),
        )?;
        debug!(
            job_id = %job.id,
            format_id = %variant.format_id,
            container = %variant.container,
            height = ?variant.height,
            "stream variant selected"
        );

        let opened = self.streams.open_stream(variant).await?;
        let total = opened.total_bytes.unwrap_or_default();

        if job.format.needs_transcode(variant) {
            writer.converting();
            let counted = count_bytes(opened.body, writer.clone(), total);
            let request = TranscodeRequest {
                format: job.format,
                audio_bitrate_kbps: job.format.audio_bitrate_kbps(),
                output_path: job.output_path.clone(),
                duration: (metadata.duration_seconds > 0)
                    .then(|| Duration::from_secs(metadata.duration_seconds)),
            };
            let progress_writer = writer.clone();
            self.transcoder
                .transcode(
                    counted,
                    request,
                    Box::new(move |percent| {
                        progress_writer.convert_progress(percent);
                    }),
                )
                .await?;
        } else {
            write_stream(opened.body, &job.output_path, writer, total).await?;
        }

        Ok(CompletedDownload {
            filename: format!("{}.{}", sanitize_title(&metadata.title), job.format.extension()),
            path: job.output_path.clone(),
        })
    }
}

fn count_bytes(body: ByteStream, writer: ProgressWriter, total: u64) -> ByteStream {
    let mut received = 0u64;
    body.inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            received += bytes.len() as u64;
            writer.bytes_received(received, total);
        }
    })
    .boxed()
}

async fn write_stream(
    mut body: ByteStream,
    path: &Path,
    writer: &ProgressWriter,
    total: u64,
) -> Result<u64, JobError> {
    let mut file = File::create(path).await?;
    let mut received = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        writer.bytes_received(received, total);
    }

    file.flush().await?;
    if total > 0 && received != total {
        warn!(
            job_id = %writer.id(),
            received, total, "upstream length differs from announced size"
        );
    }

    Ok(received)
}

/// Accepts YouTube watch, shorts and short-link URLs, with or without scheme.
pub fn normalize_video_url(input: &str) -> Result<String, JobError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(JobError::invalid_input("URL is required"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed =
        Url::parse(&candidate).map_err(|_| JobError::invalid_input("Invalid YouTube URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(JobError::invalid_input("Invalid YouTube URL"));
    }

    let host = parsed
        .host_str()
        .map(|host| host.to_ascii_lowercase())
        .ok_or_else(|| JobError::invalid_input("Invalid YouTube URL"))?;
    let host_supported = SUPPORTED_HOSTS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")));
    let has_target = !parsed.path().trim_matches('/').is_empty();

    if !host_supported || !has_target {
        return Err(JobError::invalid_input("Invalid YouTube URL"));
    }

    Ok(parsed.to_string())
}
