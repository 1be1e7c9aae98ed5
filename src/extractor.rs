use std::{collections::HashMap, io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::{debug, warn};

use crate::{
    error::JobError,
    media::{Author, StreamVariant, VideoMetadata},
};

pub const YT_DLP_TIMEOUT_SECONDS: u64 = 180;

/// Source of video metadata and the stream variants a job can pick from.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, JobError>;
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    id: String,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    channel_url: Option<String>,
    uploader_url: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    url: Option<String>,
    #[serde(default)]
    http_headers: HashMap<String, String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    format_note: Option<String>,
    abr: Option<f32>,
    tbr: Option<f32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    protocol: Option<String>,
}

/// Metadata source backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpMetadataSource {
    binary: PathBuf,
    timeout: Duration,
}

impl YtDlpMetadataSource {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(YT_DLP_TIMEOUT_SECONDS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_yt_dlp(&self, args: Vec<String>) -> Result<std::process::Output, JobError> {
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| {
                JobError::MetadataFetch(format!(
                    "yt-dlp did not answer within {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    JobError::MetadataFetch(format!(
                        "yt-dlp is not installed ({}). Install it and restart the server.",
                        self.binary.display()
                    ))
                } else {
                    JobError::MetadataFetch(format!("could not run yt-dlp: {error}"))
                }
            })?;

        if !output.status.success() {
            return Err(JobError::MetadataFetch(run_error_message(&output.stderr)));
        }

        Ok(output)
    }
}

#[async_trait]
impl MetadataSource for YtDlpMetadataSource {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, JobError> {
        debug!(url, "fetching metadata with yt-dlp");
        let output = self
            .run_yt_dlp(vec![
                "-J".to_string(),
                "--no-playlist".to_string(),
                "--no-warnings".to_string(),
                url.to_string(),
            ])
            .await?;

        parse_video_info(&output.stdout)
    }
}

pub(crate) fn parse_video_info(stdout: &[u8]) -> Result<VideoMetadata, JobError> {
    let info: YtDlpVideoInfo = serde_json::from_slice(stdout).map_err(|error| {
        warn!("could not parse yt-dlp JSON: {error}");
        JobError::MetadataFetch(format!("unreadable extractor output: {error}"))
    })?;

    let variants = info
        .formats
        .iter()
        .filter_map(variant_from_format)
        .collect::<Vec<_>>();

    Ok(VideoMetadata {
        id: info.id,
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        duration_seconds: info.duration.unwrap_or_default().max(0.0).round() as u64,
        thumbnail_url: info.thumbnail,
        author: Author {
            name: info
                .uploader
                .or(info.channel)
                .unwrap_or_else(|| "Unknown".to_string()),
            channel_url: info.channel_url.or(info.uploader_url),
        },
        variants,
    })
}

// Manifests (HLS/DASH) cannot be fetched as a single byte stream.
fn variant_from_format(format: &YtDlpFormat) -> Option<StreamVariant> {
    let url = format.url.clone()?;
    if let Some(protocol) = format.protocol.as_deref()
        && !matches!(protocol, "https" | "http")
    {
        return None;
    }

    let has_video = has_video(format);
    let has_audio = has_audio(format);
    if !has_video && !has_audio {
        return None;
    }

    let quality_label = if has_video {
        format
            .height
            .map(|height| format!("{height}p"))
            .or_else(|| format.format_note.clone())
    } else {
        format.format_note.clone()
    };

    Some(StreamVariant {
        format_id: format.format_id.clone(),
        url,
        http_headers: format.http_headers.clone(),
        has_video,
        has_audio,
        height: format.height,
        audio_bitrate_kbps: format.abr.or(if has_video { None } else { format.tbr }),
        container: format.ext.clone().unwrap_or_else(|| "mp4".to_string()),
        content_length: format
            .filesize
            .or(format.filesize_approx)
            .filter(|bytes| *bytes > 0.0)
            .map(|bytes| bytes as u64),
        quality_label,
    })
}

fn has_video(format: &YtDlpFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &YtDlpFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the request")
        .to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        "unsupported or invalid URL".to_string()
    } else if lower.contains("video unavailable") || lower.contains("private video") {
        "video is unavailable".to_string()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Rick Astley - Never Gonna Give You Up",
        "duration": 212.0,
        "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/maxresdefault.jpg",
        "uploader": "Rick Astley",
        "channel_url": "https://www.youtube.com/channel/UCuAXFkgsw1L7xaCfnd5JJOw",
        "formats": [
            {"format_id": "sb0", "url": "https://i.ytimg.com/sb/0", "ext": "mhtml", "vcodec": "none", "acodec": "none", "protocol": "mhtml"},
            {"format_id": "140", "url": "https://rr.googlevideo.com/140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5, "filesize": 3433514, "protocol": "https", "format_note": "medium"},
            {"format_id": "18", "url": "https://rr.googlevideo.com/18", "ext": "mp4", "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "height": 360, "tbr": 503.2, "filesize_approx": 13371394, "protocol": "https", "http_headers": {"User-Agent": "Mozilla/5.0"}},
            {"format_id": "96", "url": "https://manifest.googlevideo.com/96", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "mp4a.40.2", "height": 1080, "protocol": "m3u8_native"},
            {"format_id": "137", "url": "https://rr.googlevideo.com/137", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "none", "height": 1080, "protocol": "https"}
        ]
    }"#;

    #[test]
    fn parses_metadata_and_keeps_direct_streams() {
        let metadata = parse_video_info(SAMPLE.as_bytes()).unwrap();

        assert_eq!(metadata.id, "dQw4w9WgXcQ");
        assert_eq!(metadata.duration_seconds, 212);
        assert_eq!(metadata.author.name, "Rick Astley");

        let ids: Vec<&str> = metadata
            .variants
            .iter()
            .map(|variant| variant.format_id.as_str())
            .collect();
        assert_eq!(ids, vec!["140", "18", "137"]);
    }

    #[test]
    fn maps_capabilities_and_sizes() {
        let metadata = parse_video_info(SAMPLE.as_bytes()).unwrap();
        let audio = &metadata.variants[0];
        let muxed = &metadata.variants[1];
        let video_only = &metadata.variants[2];

        assert!(audio.has_audio && !audio.has_video);
        assert_eq!(audio.audio_bitrate_kbps, Some(129.5));
        assert_eq!(audio.content_length, Some(3_433_514));

        assert!(muxed.has_audio && muxed.has_video);
        assert_eq!(muxed.quality_label.as_deref(), Some("360p"));
        assert_eq!(muxed.content_length, Some(13_371_394));
        assert_eq!(
            muxed.http_headers.get("User-Agent").map(String::as_str),
            Some("Mozilla/5.0")
        );

        assert!(video_only.has_video && !video_only.has_audio);
    }

    #[test]
    fn invalid_json_is_a_metadata_error() {
        let error = parse_video_info(b"not json").unwrap_err();
        assert!(matches!(error, JobError::MetadataFetch(_)));
    }

    #[test]
    fn summarizes_yt_dlp_errors() {
        let stderr = b"WARNING: something\nERROR: [generic] Unsupported URL: https://example.com\n";
        assert_eq!(run_error_message(stderr), "unsupported or invalid URL");
        assert_eq!(
            run_error_message(b""),
            "yt-dlp could not complete the request"
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stalled_yt_dlp_is_killed_on_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("yt-dlp.pid");
        let script = dir.path().join("yt-dlp");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let source = YtDlpMetadataSource::new(&script).with_timeout(Duration::from_millis(500));
        let error = source
            .fetch_metadata("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            JobError::MetadataFetch(message) if message.contains("did not answer")
        ));

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let stat_path = format!("/proc/{pid}/stat");
        let mut alive = true;
        for _ in 0..50 {
            // A killed but not yet reaped child shows up as a zombie.
            alive = std::fs::read_to_string(&stat_path)
                .map(|stat| !stat.contains(") Z "))
                .unwrap_or(false);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "yt-dlp process {pid} outlived the timeout");
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_metadata_error() {
        let source = YtDlpMetadataSource::new("/nonexistent/yt-dlp-binary");
        let error = source
            .fetch_metadata("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            JobError::MetadataFetch(message) if message.contains("not installed")
        ));
    }
}
