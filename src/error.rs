//! Error taxonomy for the distribution subsystem
//!
//! The store and registry components return rich causes; the pipeline
//! classifies them and the HTTP layer maps each kind to a status code.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DistributionError>;

#[derive(Debug, Error)]
pub enum DistributionError {
    /// The reference failed to parse or normalize.
    #[error("invalid model reference: {0}")]
    InvalidReference(String),

    /// Local or remote lookup failed.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The registry rejected our credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Removal without force on a model carrying multiple tags, or removal
    /// of a model while a bundle still references it.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Manifest or config media type newer than this client understands.
    #[error("unsupported media type {0:?} - try upgrading")]
    UnsupportedMediaType(String),

    /// Safetensors models cannot be served by this runtime.
    #[error("safetensors models are not currently supported - this runtime only serves GGUF format models")]
    UnsupportedFormat,

    /// The memory-check gate rejected the pull.
    #[error("insufficient memory for model {reference:?}: required {required} bytes, available {available} bytes")]
    InsufficientMemory {
        reference: String,
        required: u64,
        available: u64,
    },

    /// A blob's content did not hash to its expected digest.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Hash mismatch twice in a row for the same layer.
    #[error("corrupted download for {digest}: hash mismatch after retry")]
    CorruptedDownload { digest: String },

    /// A required collaborator is not running or not configured.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The client disconnected or the operation was explicitly canceled.
    /// Never reported as an error to the log.
    #[error("operation canceled")]
    Cancelled,

    /// The requested mutation cannot be applied, e.g. repackaging with
    /// layer changes.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Internal(String),
}

impl DistributionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DistributionError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DistributionError::ModelNotFound(_))
    }
}
