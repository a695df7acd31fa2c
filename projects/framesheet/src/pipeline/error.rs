// Error types for the two contract boundaries of the pipeline:
// submission-time validation and in-flight processing failures.

/// Rejections raised before a job record exists.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("invalid params: {0}")]
    Malformed(String),

    #[error("unsupported format, allowed: {0}")]
    UnsupportedFormat(String),

    #[error("file too large, limit is {0}MB")]
    TooLarge(u64),

    #[error("missing video file")]
    MissingFile,
}

impl ValidationError {
    pub fn out_of_range(field: &'static str, min: f64, max: f64, value: f64) -> Self {
        Self::OutOfRange {
            field,
            min,
            max,
            value,
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Failures of a running pipeline. Each maps to a stable category code that
/// ends up in the job record's public `error.code`.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("video not found: {0}")]
    VideoNotFound(String),

    #[error("no frames extracted")]
    NoFrames,

    #[error("video is {duration:.1}s long, limit is {limit}s")]
    VideoTooLong { duration: f64, limit: u32 },

    #[error("frame extraction failed: {0:#}")]
    Extraction(anyhow::Error),

    #[error("matting failed: {0:#}")]
    Matting(anyhow::Error),

    #[error("layout impossible: {0}")]
    Layout(String),

    #[error("job canceled")]
    Canceled,

    #[error("job exceeded timeout of {0}s")]
    Timeout(u64),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::VideoNotFound(_) => "VIDEO_NOT_FOUND",
            Self::NoFrames => "NO_FRAMES",
            Self::VideoTooLong { .. } => "VIDEO_TOO_LONG",
            Self::Extraction(_) => "EXTRACTION_ERROR",
            Self::Matting(_) => "MATTING_ERROR",
            Self::Layout(_) => "LAYOUT_ERROR",
            Self::Canceled => "CANCELED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Other(_) => "PROCESSING_ERROR",
        }
    }
}
