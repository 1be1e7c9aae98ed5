use std::path::PathBuf;

use tokio::time::Duration;
use tracing::warn;

use crate::{
    cache::DEFAULT_METADATA_TTL,
    progress::{DEFAULT_PROGRESS_CAPACITY, DEFAULT_PROGRESS_RETENTION},
    stream::{DEFAULT_USER_AGENT, StreamSourceConfig},
};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_DOWNLOADS_DIR: &str = "./downloads";
pub const DEFAULT_SWEEP_INTERVAL_MINUTES: u64 = 30;
pub const DEFAULT_FILE_MAX_AGE_MINUTES: u64 = 60;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_FILE_DELETE_DELAY_SECONDS: u64 = 5;

/// Runtime settings, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub downloads_dir: PathBuf,
    /// Normalized `scheme://host[:port]` origins. Empty allows any origin.
    pub allowed_origins: Vec<String>,
    pub sweep_interval: Duration,
    pub file_max_age: Duration,
    pub metadata_ttl: Duration,
    pub progress_retention: Duration,
    pub progress_capacity: usize,
    pub max_concurrent_downloads: usize,
    pub file_delete_delay: Duration,
    pub yt_dlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub upstream: StreamSourceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any `name -> value` source. Missing, zero or
    /// unparsable numbers fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };

        let upstream = StreamSourceConfig {
            user_agent: text("UPSTREAM_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            cookie: text("UPSTREAM_COOKIE"),
            ..StreamSourceConfig::default()
        };

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            downloads_dir: text("DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_DIR)),
            allowed_origins: parse_origins(text("ALLOWED_ORIGINS").as_deref()),
            sweep_interval: minutes(read_positive(
                &lookup,
                "SWEEP_INTERVAL_MINUTES",
                DEFAULT_SWEEP_INTERVAL_MINUTES,
            )),
            file_max_age: minutes(read_positive(
                &lookup,
                "FILE_MAX_AGE_MINUTES",
                DEFAULT_FILE_MAX_AGE_MINUTES,
            )),
            metadata_ttl: Duration::from_secs(read_positive(
                &lookup,
                "METADATA_CACHE_TTL_SECONDS",
                DEFAULT_METADATA_TTL.as_secs(),
            )),
            progress_retention: minutes(read_positive(
                &lookup,
                "PROGRESS_RETENTION_MINUTES",
                DEFAULT_PROGRESS_RETENTION.as_secs() / 60,
            )),
            progress_capacity: read_positive(
                &lookup,
                "PROGRESS_CAPACITY",
                DEFAULT_PROGRESS_CAPACITY as u64,
            ) as usize,
            max_concurrent_downloads: read_positive(
                &lookup,
                "MAX_CONCURRENT_DOWNLOADS",
                DEFAULT_MAX_CONCURRENT_DOWNLOADS as u64,
            ) as usize,
            file_delete_delay: Duration::from_secs(read_positive(
                &lookup,
                "FILE_DELETE_DELAY_SECONDS",
                DEFAULT_FILE_DELETE_DELAY_SECONDS,
            )),
            yt_dlp_path: text("YT_DLP_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("yt-dlp")),
            ffmpeg_path: text("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            upstream,
        }
    }
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

fn read_positive<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };

    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => value,
        _ => {
            warn!("{name}={raw:?} is not a positive integer, using {default}");
            default
        }
    }
}

fn resolve_bind_addr<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(configured) = lookup("APP_ADDR")
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = lookup("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_origins(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| {
            let normalized = normalize_origin(origin);
            if normalized.is_none() {
                warn!("ignoring invalid origin in ALLOWED_ORIGINS: {origin}");
            }
            normalized
        })
        .collect()
}

/// Reduces an origin to `scheme://host[:port]`, dropping default ports.
pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = url::Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
