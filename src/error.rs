use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    /// No staged images were supplied for a manual save.
    #[error("no staged images to save")]
    EmptyBatch,

    /// The staged file behind a reference no longer exists (host temp cleanup).
    #[error("staged image not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another writer created the target between the counter scan and our write.
    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("no counter value left for {stem:?} in {}", folder.display())]
    CounterExhausted { folder: PathBuf, stem: String },

    #[error("invalid filename prefix {prefix:?}: {reason}")]
    InvalidPrefix { prefix: String, reason: &'static str },

    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("png encode error: {0}")]
    Encode(#[from] png::EncodingError),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SinkError {
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write { path: path.into(), source }
    }

    /// Client-side mistakes, as opposed to failures of the sink itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyBatch | Self::InvalidPrefix { .. } | Self::InvalidReference(_) | Self::InvalidInput(_)
        )
    }
}

pub type SinkResult<T> = Result<T, SinkError>;
