use std::path::PathBuf;
use thiserror::Error;

use crate::filter_graph::GraphError;

/// Failures a conversion job can end with
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The job carries no usable source
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Rejected at admission, before any resource was allocated
    #[error("job is too old ({age_secs}s since enqueue, limit {limit_secs}s)")]
    StaleJob { age_secs: i64, limit_secs: u64 },

    #[error("ffprobe failed for {input}: {message}")]
    ProbeFailed { input: String, message: String },

    #[error("no video stream found in {input}")]
    NoVideoStream { input: String },

    /// ffmpeg exited non-zero; carries enough context to reproduce
    #[error("ffmpeg encode failed for {input}: {message} (source: {probed})")]
    EncodeFailed {
        message: String,
        input: String,
        probed: String,
    },

    #[error("ffmpeg encode timed out after {secs}s, process was killed")]
    EncodeTimeout { secs: u64 },

    /// ffmpeg reported success but the artifact cannot be probed
    #[error("encoded artifact {} is unreadable: {message}", path.display())]
    InvalidOutput { path: PathBuf, message: String },

    #[error("post-processing failed: {0}")]
    PostProcessFailed(String),

    /// Recoverable: the resolver falls back to the original URL
    #[error("download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("filter graph: {0}")]
    Graph(#[from] GraphError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// Short machine-readable name, stored in job records next to the message
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::InvalidInput(_) => "invalid_input",
            ConvertError::StaleJob { .. } => "stale_job",
            ConvertError::ProbeFailed { .. } => "probe_failed",
            ConvertError::NoVideoStream { .. } => "no_video_stream",
            ConvertError::EncodeFailed { .. } => "encode_failed",
            ConvertError::EncodeTimeout { .. } => "encode_timeout",
            ConvertError::InvalidOutput { .. } => "invalid_output",
            ConvertError::PostProcessFailed(_) => "post_process_failed",
            ConvertError::DownloadFailed { .. } => "download_failed",
            ConvertError::Graph(_) => "invalid_graph",
            ConvertError::Io(_) => "io",
        }
    }
}

pub type ConvertResult<T> = Result<T, ConvertError>;
