//! Error types for the Themis model.

use thiserror::Error;

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while building, loading or running a model.
///
/// A failed call never leaves shared parameters partially modified.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The model configuration is inconsistent.
    #[error("invalid model config: {0}")]
    Config(String),

    /// A token id or sequence length falls outside the configured range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Parameter tensors disagree with the configuration.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A checkpoint has a missing or unsupported format identifier.
    #[error("checkpoint format error: {0}")]
    Format(String),

    /// The forward pass observed a cancellation request.
    #[error("forward pass cancelled")]
    Cancelled,

    /// Numeric kernel failure.
    #[error("kernel error: {0}")]
    Kernel(#[from] anyhow::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Safetensors encoding or decoding error.
    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
