use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream::BoxStream};
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tokio::time::Duration;
use tracing::debug;

use crate::{error::JobError, media::StreamVariant};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

pub type ByteStream = BoxStream<'static, Result<Bytes, JobError>>;

/// An open upstream transfer. `total_bytes` is what the server or the
/// extractor announced, if anything.
pub struct OpenedStream {
    pub total_bytes: Option<u64>,
    pub body: ByteStream,
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn open_stream(&self, variant: &StreamVariant) -> Result<OpenedStream, JobError>;
}

/// Identity presented to the upstream media host.
#[derive(Debug, Clone)]
pub struct StreamSourceConfig {
    pub user_agent: String,
    pub cookie: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for StreamSourceConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookie: None,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Streams variant bytes over HTTP(S). No overall request timeout is set:
/// a download may legitimately take longer than any fixed bound.
#[derive(Debug, Clone)]
pub struct HttpStreamSource {
    client: reqwest::Client,
}

impl HttpStreamSource {
    pub fn new(config: &StreamSourceConfig) -> Result<Self, JobError> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = config.cookie.as_deref() {
            let value = HeaderValue::from_str(cookie).map_err(|_| {
                JobError::invalid_input("upstream cookie is not a valid header value")
            })?;
            headers.insert(COOKIE, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|error| JobError::Stream(format!("could not build HTTP client: {error}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl StreamSource for HttpStreamSource {
    async fn open_stream(&self, variant: &StreamVariant) -> Result<OpenedStream, JobError> {
        let mut request = self.client.get(&variant.url);
        for (name, value) in &variant.http_headers {
            // The injected identity wins over extractor hints.
            if name.eq_ignore_ascii_case(USER_AGENT.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| JobError::Stream(error.to_string()))?;

        let total_bytes = response.content_length().or(variant.content_length);
        debug!(
            format_id = %variant.format_id,
            total_bytes = ?total_bytes,
            "upstream stream opened"
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|error| JobError::Stream(error.to_string())))
            .boxed();

        Ok(OpenedStream { total_bytes, body })
    }
}
