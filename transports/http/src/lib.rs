//! HTTP transport for the algoserve runtime
//!
//! Exposes registered algorithms as JSON endpoints. Business outcomes travel
//! as envelope `code`s with HTTP 200; transport statuses are reserved for
//! pre-dispatch failures (malformed body, lifecycle gate, readiness probe).

mod error;
mod server;
mod service;

pub use error::{Error, Result};
pub use server::HttpServer;
pub use service::AlgorithmHttpService;
