//! Algoserve Runtime Core - Transport-agnostic algorithm execution engine
//!
//! This crate hosts a catalog of registered algorithms and executes them with
//! hard timeouts and OS-process isolation, without any transport-specific
//! dependencies.
//!
//! # Architecture
//!
//! Runtime-core is a pure library that:
//! - Defines the wire envelope and per-request context ([`protocol`], [`context`])
//! - Holds the algorithm catalog with YAML override support ([`registry`], [`spec`])
//! - Provides the execution backends, including the supervised worker pool
//!   that kills and replaces workers on deadline overrun ([`execution`])
//! - Drives the server lifecycle state machine ([`lifecycle`])
//!
//! Transport implementations (HTTP, ...) are separate crates that depend on
//! `algoserve-runtime-core`, build [`execution::ExecutionRequest`]s, and map
//! [`execution::ExecutionResult`]s back onto their wire format.
//!
//! # Worker mode
//!
//! Pool workers are this same host binary re-entered with a marker
//! environment variable. A host `main` therefore starts with:
//!
//! ```ignore
//! let registry = build_registry()?;
//! if algoserve_runtime_core::worker::maybe_run_worker(&registry) {
//!     return Ok(());
//! }
//! // ... start lifecycle + transport
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod execution;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod settings;
pub mod spec;
pub mod worker;

mod error;
pub use error::{Error, Result};

/// Initialize logging for a host process.
///
/// Installs a `tracing` subscriber honoring `RUST_LOG`, defaulting to
/// `info`. Call once at startup; worker-mode children skip this and log to
/// stderr, which the parent pool re-emits.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Algoserve runtime core initialized");
    Ok(())
}
