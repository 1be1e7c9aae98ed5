use std::{
    collections::VecDeque,
    io::ErrorKind,
    path::PathBuf,
    process::Stdio,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    time::Duration,
};
use tracing::{debug, warn};

use crate::{error::JobError, media::OutputFormat, stream::ByteStream};

const STDERR_TAIL_LINES: usize = 8;

/// Called with a 0–100 completion estimate while the transcoder runs.
pub type ProgressCallback = Box<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub format: OutputFormat,
    pub audio_bitrate_kbps: Option<u32>,
    pub output_path: PathBuf,
    /// Source duration, used to turn ffmpeg's output timestamp into a percentage.
    pub duration: Option<Duration>,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Consumes `input` and writes the converted media to `request.output_path`.
    /// Errors of the input stream are returned unchanged.
    async fn transcode(
        &self,
        input: ByteStream,
        request: TranscodeRequest,
        on_progress: ProgressCallback,
    ) -> Result<(), JobError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

/// ffmpeg arguments reading from stdin and writing `request.output_path`.
pub fn build_ffmpeg_args(request: &TranscodeRequest) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-nostats".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-progress".to_string(),
        "pipe:2".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
    ];

    match request.format {
        OutputFormat::Mp3 => {
            args.extend(["-vn", "-c:a", "libmp3lame"].map(String::from));
            push_bitrate(&mut args, request.audio_bitrate_kbps);
            args.extend(["-f", "mp3"].map(String::from));
        }
        OutputFormat::M4a => {
            args.extend(["-vn", "-c:a", "aac"].map(String::from));
            push_bitrate(&mut args, request.audio_bitrate_kbps);
            args.extend(["-f", "ipod"].map(String::from));
        }
        OutputFormat::Mp4 => {
            args.extend(["-c", "copy", "-movflags", "+faststart", "-f", "mp4"].map(String::from));
        }
        OutputFormat::Webm => {
            args.extend(["-c:v", "libvpx-vp9", "-c:a", "libopus", "-f", "webm"].map(String::from));
        }
    }

    args.push(request.output_path.to_string_lossy().to_string());
    args
}

fn push_bitrate(args: &mut Vec<String>, bitrate_kbps: Option<u32>) {
    if let Some(kbps) = bitrate_kbps {
        args.push("-b:a".to_string());
        args.push(format!("{kbps}k"));
    }
}

/// Reads one `key=value` line of `-progress` output and returns a percentage
/// when it carries the output timestamp.
pub fn parse_progress_line(line: &str, duration: Option<Duration>) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    let out_ms = match key {
        "out_time_us" => value.trim().parse::<i64>().ok()? / 1000,
        "out_time_ms" => value.trim().parse::<i64>().ok()? / 1000,
        "progress" if value.trim() == "end" => return Some(100.0),
        _ => return None,
    };

    let total_ms = duration?.as_millis() as f64;
    if total_ms <= 0.0 || out_ms < 0 {
        return None;
    }

    Some((out_ms as f64 / total_ms * 100.0).min(100.0))
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        mut input: ByteStream,
        request: TranscodeRequest,
        on_progress: ProgressCallback,
    ) -> Result<(), JobError> {
        let args = build_ffmpeg_args(&request);
        debug!("running {} {}", self.binary.display(), args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    JobError::Transcode(format!(
                        "ffmpeg is not installed ({})",
                        self.binary.display()
                    ))
                } else {
                    JobError::Transcode(format!("could not start ffmpeg: {error}"))
                }
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| JobError::Transcode("ffmpeg stdin was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobError::Transcode("ffmpeg stderr was not captured".to_string()))?;

        let feed = async move {
            while let Some(chunk) = input.next().await {
                let chunk = chunk?;
                if let Err(error) = stdin.write_all(&chunk).await {
                    // ffmpeg quit early; its exit status explains why.
                    debug!("ffmpeg stopped reading input: {error}");
                    return Ok(());
                }
            }
            if let Err(error) = stdin.shutdown().await {
                debug!("could not close ffmpeg stdin: {error}");
            }
            Ok::<(), JobError>(())
        };

        let duration = request.duration;
        let watch = async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(percent) = parse_progress_line(&line, duration) {
                    on_progress(percent);
                } else if !line.contains('=') && !line.trim().is_empty() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail
        };

        let (fed, tail) = tokio::join!(feed, watch);
        if let Err(error) = fed {
            let _ = child.kill().await;
            return Err(error);
        }

        let status = child
            .wait()
            .await
            .map_err(|error| JobError::Transcode(format!("could not wait for ffmpeg: {error}")))?;

        if status.success() {
            return Ok(());
        }

        let detail = tail.into_iter().collect::<Vec<_>>().join(" | ");
        warn!(status = ?status.code(), "ffmpeg failed: {detail}");
        Err(JobError::Transcode(if detail.is_empty() {
            format!("ffmpeg exited with status {status}")
        } else {
            detail
        }))
    }
}
