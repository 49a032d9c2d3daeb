//! Error types shared by every stage of the pipeline.
use std::fmt;

/// The broad category an [`Error`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ShapeMismatch,
    UnsupportedOperation,
    Cancellation,
    InferenceRuntime,
    InvalidState,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid or missing checkpoint paths, out-of-range hyperparameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("shape mismatch for {context}: expected {expected}, got {actual}")]
    ShapeMismatch { context: String, expected: Dims, actual: Dims },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Cooperative cancellation, not a failure.
    #[error("generation cancelled")]
    Cancelled,

    #[error("inference runtime error: {0}")]
    InferenceRuntime(#[from] tch::TchError),

    #[error("timesteps have not been set, call set_timesteps first")]
    TimestepsNotSet,

    #[error("timestep {0} is not part of the inference schedule")]
    UnknownTimestep(usize),

    #[error("solver order {requested} exceeds the configured maximum {max}")]
    OrderTooHigh { requested: usize, max: usize },

    #[error("generated image was flagged by the safety checker")]
    UnsafeContent,

    #[error("models are still used by {0} consumer(s)")]
    ModelsInUse(usize),

    #[error("error opening {path:?}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Io { .. } | Self::Json(_) => ErrorKind::Configuration,
            Self::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Self::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            Self::Cancelled => ErrorKind::Cancellation,
            Self::InferenceRuntime(_) | Self::UnsafeContent | Self::Image(_) => {
                ErrorKind::InferenceRuntime
            }
            Self::TimestepsNotSet
            | Self::UnknownTimestep(_)
            | Self::OrderTooHigh { .. }
            | Self::ModelsInUse(_) => ErrorKind::InvalidState,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn shape(context: impl Into<String>, expected: &[i64], actual: &[i64]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: Dims(expected.to_vec()),
            actual: Dims(actual.to_vec()),
        }
    }
}

/// A dimension vector, displayed as `[1, 4, 64, 64]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dims(pub Vec<i64>);

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
