//! Execution records and the executor contract
//!
//! [`ExecutionRequest`] is the internal submit payload built by a transport
//! after envelope validation; [`ExecutionResult`] is the single terminal
//! record every admitted request resolves to. Failures are values carried in
//! `error`, typed by [`ErrorKind`]; nothing in the execution subsystem throws
//! across the transport boundary.

mod executor;
pub mod pool;

pub use executor::{
    DispatchingExecutor, Executor, ExecutorLifecycleHook, InlineExecutor, IsolatedPoolExecutor,
};
pub use pool::{PoolConfig, ProcessPoolExecutor};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ResponseMeta;
use crate::protocol::AlgorithmContext;
use crate::spec::AlgorithmSpec;

/// Error taxonomy for execution failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Payload failed schema validation or coercion
    Validation,
    /// Hard deadline exceeded; the worker was killed
    Timeout,
    /// Admission queue full or executor shut down
    Rejected,
    /// User code failed; the worker keeps serving
    Runtime,
    /// Worker exited without producing a result
    System,
}

impl ErrorKind {
    /// Stable lowercase name, matching the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Runtime => "runtime",
            ErrorKind::System => "system",
        }
    }
}

/// Typed execution failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Structured details (exit codes, validation paths, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Trimmed backtrace when one was captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ExecutionError {
    /// Build an error with no details.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            traceback: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Internal submit payload: spec + pre-validated input + request identity.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Resolved algorithm spec
    pub spec: Arc<AlgorithmSpec>,
    /// Input payload, already validated against the spec's input schema
    pub payload: Value,
    /// Optional hyperparameters for programmatic submitters
    pub hyperparams: Option<Value>,
    /// Caller request id
    pub request_id: String,
    /// Caller request timestamp
    pub request_datetime: DateTime<Utc>,
    /// Optional trace id
    pub trace_id: Option<String>,
    /// Optional pass-through context
    pub context: Option<AlgorithmContext>,
    /// Request-level timeout; `None` falls through to the spec timeout
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    /// Build a request with only the mandatory pieces set.
    pub fn new(spec: Arc<AlgorithmSpec>, payload: Value, request_id: impl Into<String>) -> Self {
        Self {
            spec,
            payload,
            hyperparams: None,
            request_id: request_id.into(),
            request_datetime: Utc::now(),
            trace_id: None,
            context: None,
            timeout: None,
        }
    }

    /// Set the request-level timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Effective deadline budget: `min(request, spec)` with null elision,
    /// then the executor-wide default. `None` everywhere means no deadline.
    pub fn effective_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        let spec_timeout = self.spec.execution.timeout();
        let merged = match (self.timeout, spec_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        merged.or(default)
    }
}

/// Terminal record for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// True iff `data` is set and `error` is not
    pub success: bool,
    /// Output payload on success
    pub data: Option<Value>,
    /// Typed failure otherwise
    pub error: Option<ExecutionError>,
    /// When user code started executing
    pub started_at: Option<DateTime<Utc>>,
    /// When the terminal outcome was produced
    pub ended_at: Option<DateTime<Utc>>,
    /// Milliseconds spent waiting for a worker
    pub queue_wait_ms: Option<f64>,
    /// Milliseconds spent executing
    pub duration_ms: Option<f64>,
    /// Pid of the worker that held the task; always already released or
    /// terminated by the time the result is observable
    pub worker_pid: Option<u32>,
    /// Response metadata staged by user code, if any survived
    pub response_meta: Option<ResponseMeta>,
}

impl ExecutionResult {
    /// Successful outcome.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            started_at: None,
            ended_at: None,
            queue_wait_ms: None,
            duration_ms: None,
            worker_pid: None,
            response_meta: None,
        }
    }

    /// Failed outcome.
    pub fn fail(error: ExecutionError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            started_at: None,
            ended_at: None,
            queue_wait_ms: None,
            duration_ms: None,
            worker_pid: None,
            response_meta: None,
        }
    }

    /// Shorthand for a rejection outcome.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::fail(ExecutionError::new(ErrorKind::Rejected, message))
    }

    /// Failure kind, if this is a failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
