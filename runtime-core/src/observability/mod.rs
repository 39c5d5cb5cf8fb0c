//! Observation surface for the execution subsystem

mod metrics;

pub use metrics::ServiceMetrics;
