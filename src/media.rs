use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::JobError;

pub const SUPPORTED_FORMATS: [OutputFormat; 4] = [
    OutputFormat::Mp4,
    OutputFormat::Webm,
    OutputFormat::Mp3,
    OutputFormat::M4a,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
    Mp3,
    M4a,
}

/// Capability set a request needs from a stream variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    AudioOnly,
    AudioVideo,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Mp3 => "mp3",
            OutputFormat::M4a => "m4a",
        }
    }

    pub fn kind(self) -> MediaKind {
        match self {
            OutputFormat::Mp3 | OutputFormat::M4a => MediaKind::AudioOnly,
            OutputFormat::Mp4 | OutputFormat::Webm => MediaKind::AudioVideo,
        }
    }

    /// Target audio bitrate when the output is re-encoded as audio.
    pub fn audio_bitrate_kbps(self) -> Option<u32> {
        match self {
            OutputFormat::Mp3 => Some(192),
            OutputFormat::M4a => Some(256),
            OutputFormat::Mp4 | OutputFormat::Webm => None,
        }
    }

    /// Whether bytes of `variant` can be written to disk as-is for this format.
    /// Audio outputs are always re-encoded; video outputs only need a remux
    /// when the upstream container differs.
    pub fn needs_transcode(self, variant: &StreamVariant) -> bool {
        match self.kind() {
            MediaKind::AudioOnly => true,
            MediaKind::AudioVideo => !variant.container.eq_ignore_ascii_case(self.extension()),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = JobError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(OutputFormat::Mp4),
            "webm" => Ok(OutputFormat::Webm),
            "mp3" => Ok(OutputFormat::Mp3),
            "m4a" => Ok(OutputFormat::M4a),
            _ => Err(JobError::invalid_input(
                "Invalid format. Allowed: mp4, webm, mp3, m4a",
            )),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::AudioOnly => write!(f, "audio"),
            MediaKind::AudioVideo => write!(f, "audio+video"),
        }
    }
}

/// One encoded rendition of the source media, as listed by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamVariant {
    pub format_id: String,
    #[serde(skip_serializing)]
    pub url: String,
    #[serde(skip_serializing)]
    pub http_headers: HashMap<String, String>,
    pub has_video: bool,
    pub has_audio: bool,
    pub height: Option<u32>,
    pub audio_bitrate_kbps: Option<f32>,
    pub container: String,
    pub content_length: Option<u64>,
    pub quality_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,
    pub channel_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    pub duration_seconds: u64,
    pub thumbnail_url: Option<String>,
    pub author: Author,
    pub variants: Vec<StreamVariant>,
}

/// Renders a duration as `h:mm:ss`, or `m:ss` below one hour.
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Strips characters that are unsafe in file names on common filesystems.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|character| {
            !character.is_control()
                && !matches!(
                    character,
                    '/' | '\\' | '?' | '<' | '>' | ':' | '*' | '|' | '"'
                )
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();

    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.chars().take(140).collect()
    }
}
