//! Error types for runtime-core

use thiserror::Error;

/// Result type alias for runtime-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for runtime-core
#[derive(Debug, Error)]
pub enum Error {
    /// Algorithm registration conflict or invalid descriptor
    #[error("Registration error: {0}")]
    Registration(String),

    /// Lookup for a (name, version) pair failed
    #[error("Algorithm not found: {0}")]
    NotFound(String),

    /// Spec metadata or payload validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Executor or worker pool failure
    #[error("Execution error: {0}")]
    Execution(String),

    /// Lifecycle transition error
    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
