pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod format_selector;
pub mod jobs;
pub mod media;
pub mod progress;
pub mod retention;
pub mod routes;
pub mod stream;
pub mod transcode;

pub use config::AppConfig;
pub use error::{ApiError, JobError};
pub use jobs::{DownloadService, Job, JobHandle, JobRequest};
pub use progress::{ProgressRecord, ProgressStatus, ProgressTable};
