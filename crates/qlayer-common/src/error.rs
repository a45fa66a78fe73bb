//! Error types for compressed layer operations

use thiserror::Error;

/// Errors produced while converting, refreshing or running a compressed layer.
///
/// None of these are retried internally. `Resource` is fatal; the others are
/// programming or configuration errors surfaced to the immediate caller.
#[derive(Debug, Error)]
pub enum QLayerError {
    /// Unknown format identifier or an unusable scheme.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation invoked in the wrong lifecycle state.
    #[error("state error: {0}")]
    State(String),

    /// The format provider failed to reconstruct the weight.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// Allocation failed.
    #[error("resource error: {0}")]
    Resource(String),

    #[error("incompatible tensor shapes: input {input:?}, weight {weight:?}")]
    ShapeMismatch { input: Vec<usize>, weight: Vec<usize> },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl QLayerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn decompression(msg: impl Into<String>) -> Self {
        Self::Decompression(msg.into())
    }

    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter { name: name.into(), reason: reason.into() }
    }

    /// Wrap a tensor backend failure raised while allocating storage.
    pub fn allocation(context: &str, err: candle_core::Error) -> Self {
        Self::Resource(format!("{context}: {err}"))
    }

    /// Fatal errors leave the process without a usable layer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Resource(_))
    }

    /// No error in this taxonomy is worth retrying.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, QLayerError>;
