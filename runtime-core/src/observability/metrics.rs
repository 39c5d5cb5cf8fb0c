//! Prometheus metrics collection
//!
//! Tracks request counters, latency histograms, queue-wait distribution, and
//! pool supervision events. Rendered as text exposition at /metrics.

use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Prometheus metrics shared by the HTTP service and the worker pools.
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Total requests processed (labeled by algorithm, version, outcome)
    pub requests_total: CounterVec,

    /// Request latency distribution in seconds (labeled by algorithm, version)
    pub request_duration_seconds: HistogramVec,

    /// In-flight execution gauge
    pub inflight_requests: IntGauge,

    /// Time spent waiting for a worker, in seconds (labeled by pool)
    pub queue_wait_seconds: HistogramVec,

    /// Worker replacements (labeled by pool and reason: timeout | crash)
    pub worker_restarts_total: CounterVec,

    /// Admission rejections (labeled by pool)
    pub rejected_total: CounterVec,

    /// Prometheus registry backing the exposition endpoint
    pub registry: Arc<Registry>,
}

impl ServiceMetrics {
    /// Create metrics registered against a custom registry.
    pub fn new(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = CounterVec::new(
            Opts::new(
                "algoserve_requests_total",
                "Total number of algorithm requests processed",
            ),
            &["algorithm", "version", "outcome"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "algoserve_request_duration_seconds",
                "Request latency distribution in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["algorithm", "version"],
        )?;

        let inflight_requests = IntGauge::new(
            "algoserve_inflight_requests",
            "Number of requests currently executing",
        )?;

        let queue_wait_seconds = HistogramVec::new(
            HistogramOpts::new(
                "algoserve_queue_wait_seconds",
                "Time spent waiting for an idle worker",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["pool"],
        )?;

        let worker_restarts_total = CounterVec::new(
            Opts::new(
                "algoserve_worker_restarts_total",
                "Workers killed and replaced by the supervisor",
            ),
            &["pool", "reason"],
        )?;

        let rejected_total = CounterVec::new(
            Opts::new(
                "algoserve_rejected_total",
                "Requests rejected at the admission queue",
            ),
            &["pool"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(inflight_requests.clone()))?;
        registry.register(Box::new(queue_wait_seconds.clone()))?;
        registry.register(Box::new(worker_restarts_total.clone()))?;
        registry.register(Box::new(rejected_total.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            inflight_requests,
            queue_wait_seconds,
            worker_restarts_total,
            rejected_total,
            registry: Arc::new(registry),
        })
    }

    /// Create with a fresh registry.
    pub fn with_default_registry() -> Result<Self, prometheus::Error> {
        Self::new(Registry::new())
    }

    /// Record an execution outcome.
    pub fn record_request(&self, algorithm: &str, version: &str, outcome: &str, seconds: f64) {
        self.requests_total
            .with_label_values(&[algorithm, version, outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[algorithm, version])
            .observe(seconds);
    }

    /// Record queue wait for a pool.
    pub fn record_queue_wait(&self, pool: &str, seconds: f64) {
        self.queue_wait_seconds
            .with_label_values(&[pool])
            .observe(seconds);
    }

    /// Record a worker replacement.
    pub fn record_worker_restart(&self, pool: &str, reason: &str) {
        self.worker_restarts_total
            .with_label_values(&[pool, reason])
            .inc();
    }

    /// Record an admission rejection.
    pub fn record_rejection(&self, pool: &str) {
        self.rejected_total.with_label_values(&[pool]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_record() {
        let metrics = ServiceMetrics::with_default_registry().unwrap();

        metrics.record_request("double", "v1", "success", 0.01);
        metrics.record_request("double", "v1", "timeout", 0.5);
        metrics.record_queue_wait("shared", 0.002);
        metrics.record_worker_restart("shared", "timeout");
        metrics.record_rejection("shared");

        let counter = metrics
            .requests_total
            .with_label_values(&["double", "v1", "success"]);
        assert!(counter.get() > 0.0);

        let families = metrics.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "algoserve_worker_restarts_total"));
    }
}
