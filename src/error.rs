use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::media::MediaKind;

/// Failures of a download job, from request validation to the final write.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Failed to fetch video info: {0}")]
    MetadataFetch(String),

    #[error("No suitable {0} format found")]
    NoSuitableFormat(MediaKind),

    #[error("Download failed: {0}")]
    Stream(String),

    #[error("Conversion failed: {0}")]
    Transcode(String),

    #[error("Write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("{0}")]
    NotFound(String),
}

impl JobError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: Some("NOT_FOUND"),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }
}

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        let message = error.to_string();
        match error {
            JobError::InvalidInput(_) => Self {
                status: StatusCode::BAD_REQUEST,
                message,
                code: Some("INVALID_INPUT"),
            },
            JobError::NotFound(_) => Self::not_found(message),
            JobError::MetadataFetch(_) => Self {
                status: StatusCode::BAD_GATEWAY,
                message,
                code: Some("METADATA_FETCH_FAILED"),
            },
            JobError::NoSuitableFormat(_) => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                message,
                code: Some("NO_SUITABLE_FORMAT"),
            },
            JobError::Stream(_) | JobError::Transcode(_) | JobError::Write(_) => {
                Self::internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}
