//! HTTP transport error types

use thiserror::Error;

/// Result type for HTTP transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP transport error types
#[derive(Debug, Error)]
pub enum Error {
    /// Server startup or bind error
    #[error("Server error: {0}")]
    ServerError(String),

    /// Error bubbled up from the runtime core
    #[error(transparent)]
    Core(#[from] algoserve_runtime_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
