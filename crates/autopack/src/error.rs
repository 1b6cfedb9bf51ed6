use std::path::PathBuf;

/// Result alias used throughout the pipeline
pub type Result<T> = std::result::Result<T, PackError>;

/// Everything that can stop (or, for subtitle length probing, degrade) a pack job
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    /// Source file is missing or unreadable
    #[error("input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// ffprobe exited non-zero or produced output we could not parse
    #[error("probe failed: {0}")]
    ProbeFailure(String),

    #[error("source has no video stream")]
    NoVideoStream,

    #[error("source has no audio stream")]
    NoAudioStream,

    /// Font attachment without a `filename` tag, it cannot be deduplicated or served
    #[error("attachment stream #{index} has no filename tag")]
    MissingAttachmentFilename { index: u32 },

    /// Expected artifact missing after an extraction run
    #[error("extraction of stream #{index} failed: {message}")]
    ExtractionFailure { index: u32, message: String },

    #[error("hashing {} failed: {source}", .path.display())]
    HashFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encode of {item} failed: {message}")]
    EncodeFailure { item: String, message: String },

    #[error("packaging failed: {0}")]
    PackagingFailure(String),

    /// Recovered locally by the subtitle selector, never aborts a job
    #[error("subtitle length probe for stream #{index} failed: {message}")]
    SubtitleLengthProbeFailure { index: u32, message: String },

    /// Pipeline task panicked or was cancelled
    #[error("job aborted: {0}")]
    Aborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
