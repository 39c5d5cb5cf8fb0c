//! Bridge between the HTTP layer and the executor/registry
//!
//! The service owns the per-request flow: resolve the spec, validate the
//! payload, submit, and fold the execution result back into a response
//! envelope. This is the single translation point between the execution
//! error taxonomy and the wire `code` catalog; response metadata staged by
//! user code overrides the default mapping on both the success and failure
//! paths.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};

use algoserve_runtime_core::execution::{ErrorKind, ExecutionRequest, Executor};
use algoserve_runtime_core::observability::ServiceMetrics;
use algoserve_runtime_core::protocol::{
    api_error, api_success, codes, AlgorithmRequest, AlgorithmResponse,
};
use algoserve_runtime_core::registry::AlgorithmRegistry;
use algoserve_runtime_core::spec::{AlgorithmSpec, LoggingConfig};

/// HTTP-facing execution service.
pub struct AlgorithmHttpService {
    registry: Arc<AlgorithmRegistry>,
    executor: Arc<dyn Executor>,
    metrics: Option<Arc<ServiceMetrics>>,
}

impl AlgorithmHttpService {
    /// Assemble the service from its collaborators.
    pub fn new(
        registry: Arc<AlgorithmRegistry>,
        executor: Arc<dyn Executor>,
        metrics: Option<Arc<ServiceMetrics>>,
    ) -> Self {
        Self {
            registry,
            executor,
            metrics,
        }
    }

    /// The registry backing this service.
    pub fn registry(&self) -> &Arc<AlgorithmRegistry> {
        &self.registry
    }

    /// Whether the executor reports itself started.
    pub fn executor_started(&self) -> bool {
        self.executor.is_started()
    }

    /// Execute one validated envelope and produce the response envelope.
    pub async fn invoke(
        &self,
        name: &str,
        version: &str,
        request: AlgorithmRequest<Value>,
    ) -> AlgorithmResponse<Value> {
        let request_id = Some(request.request_id.clone());
        let datetime = request.datetime;

        let spec = match self.registry.get(name, version) {
            Ok(spec) => spec,
            Err(e) => {
                return api_error(codes::NOT_FOUND, e.to_string(), request_id, datetime, None);
            }
        };

        if let Err(message) = spec.validate_input(&request.data) {
            return api_error(
                codes::INVALID_INPUT,
                format!("input validation failed: {message}"),
                request_id,
                datetime,
                None,
            );
        }

        let exec_request = ExecutionRequest {
            spec: Arc::clone(&spec),
            payload: request.data.clone(),
            hyperparams: None,
            request_id: request.request_id.clone(),
            request_datetime: request.datetime,
            trace_id: request.trace_id().map(str::to_string),
            context: request.context.clone(),
            timeout: None,
        };

        if let Some(metrics) = &self.metrics {
            metrics.inflight_requests.inc();
        }
        let started = Instant::now();
        let result = self.executor.submit(exec_request).await;
        let elapsed = started.elapsed().as_secs_f64();
        if let Some(metrics) = &self.metrics {
            metrics.inflight_requests.dec();
            let outcome = result
                .error_kind()
                .map(|k| k.as_str())
                .unwrap_or("success");
            metrics.record_request(&spec.name, &spec.version, outcome, elapsed);
        }

        let meta = result.response_meta.clone();
        let meta_context = meta.as_ref().and_then(|m| m.context.clone());

        let response = if result.success {
            let mut envelope = api_success(result.data.clone(), request_id, datetime, meta_context);
            if let Some(meta) = &meta {
                if let Some(code) = meta.code {
                    envelope.code = code;
                }
                if let Some(message) = &meta.message {
                    envelope.message = message.clone();
                }
            }
            envelope
        } else {
            let (mut code, mut message) = match &result.error {
                Some(error) => (error_code(error.kind), error.message.clone()),
                None => (codes::SYSTEM, "unknown execution failure".to_string()),
            };
            if let Some(meta) = &meta {
                if let Some(meta_code) = meta.code {
                    code = meta_code;
                }
                if let Some(meta_message) = &meta.message {
                    message = meta_message.clone();
                }
            }
            api_error(code, message, request_id, datetime, meta_context)
        };

        self.log_outcome(&spec, &request, &response, result.duration_ms);
        response
    }

    fn log_outcome(
        &self,
        spec: &AlgorithmSpec,
        request: &AlgorithmRequest<Value>,
        response: &AlgorithmResponse<Value>,
        duration_ms: Option<f64>,
    ) {
        let logging = &spec.logging;
        if !logging.enabled {
            return;
        }
        let success = response.code == codes::SUCCESS || response.data.is_some();
        let include_payloads = !logging.on_error_only || !success;

        let input = (logging.log_input && include_payloads)
            .then(|| payload_preview(&request.data, logging));
        let output = (logging.log_output && include_payloads).then(|| {
            response
                .data
                .as_ref()
                .map(|d| payload_preview(d, logging))
                .unwrap_or_else(|| "null".to_string())
        });

        if success {
            info!(
                algorithm = %spec.name,
                version = %spec.version,
                request_id = %request.request_id,
                code = response.code,
                duration_ms,
                input,
                output,
                "algorithm request completed"
            );
        } else {
            warn!(
                algorithm = %spec.name,
                version = %spec.version,
                request_id = %request.request_id,
                code = response.code,
                message = %response.message,
                duration_ms,
                input,
                output,
                "algorithm request failed"
            );
        }
    }
}

/// Default envelope code for an execution failure kind.
fn error_code(kind: ErrorKind) -> i64 {
    match kind {
        ErrorKind::Validation => codes::INVALID_INPUT,
        ErrorKind::Timeout => codes::TIMEOUT,
        ErrorKind::Rejected => codes::REJECTED,
        ErrorKind::Runtime => codes::RUNTIME,
        ErrorKind::System => codes::SYSTEM,
    }
}

/// Render a payload for logs: redact configured fields, then truncate.
fn payload_preview(payload: &Value, logging: &LoggingConfig) -> String {
    let mut payload = payload.clone();
    if let Value::Object(map) = &mut payload {
        for field in &logging.redact_fields {
            if let Some(slot) = map.get_mut(field) {
                *slot = Value::String("***".to_string());
            }
        }
    }
    let mut rendered = payload.to_string();
    if rendered.chars().count() > logging.max_length {
        rendered = rendered.chars().take(logging.max_length).collect();
        rendered.push('…');
    }
    rendered
}
