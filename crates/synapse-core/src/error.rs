//! Error types for Synapse Core.

use thiserror::Error;

/// Result type alias for Synapse operations.
pub type Result<T> = std::result::Result<T, SynapseError>;

/// Errors that can occur in Synapse operations.
#[derive(Error, Debug)]
pub enum SynapseError {
    /// Invalid model or sharding configuration, caught at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensors with incompatible dimensions reached a layer.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A collective operation failed or participants disagreed.
    #[error("communication error: {0}")]
    Comm(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
