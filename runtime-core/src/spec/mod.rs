//! Algorithm descriptors
//!
//! An [`AlgorithmSpec`] is the immutable record the registry stores for each
//! `(name, version)`: metadata, I/O schemas, execution hints, and the
//! type-erased entrypoint. Specs are produced by [`SpecBuilder`], which
//! enforces the registration-time validation rules so misdeclared algorithms
//! fail at startup rather than on the first request.

mod algorithm;
mod builder;

pub use algorithm::{Algorithm, Entrypoint, EntrypointKind, HyperParams, NoParams};
pub(crate) use algorithm::{
    initialize_guarded, run_guarded, ErasedAlgorithm, RunFailure,
};
pub use builder::SpecBuilder;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form algorithm categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmType {
    /// Predictive models
    Prediction,
    /// Data preparation steps
    Prepare,
    /// Programme/schedule generation
    Programme,
    /// Planning algorithms
    Planning,
}

/// Where user code runs for a given spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Run in the calling process; no hard timeout is possible. Development
    /// convenience only.
    #[serde(rename = "IN_PROCESS")]
    InProcess,
    /// Run in a supervised worker process (default).
    #[serde(rename = "PROCESS_POOL")]
    ProcessPool,
}

/// Execution hints recorded with the algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    /// Backend selection
    pub execution_mode: ExecutionMode,

    /// Cache one instance per worker process across requests. Each worker
    /// holds its own instance; callers needing a single global instance must
    /// also set `isolated_pool = true` and `max_workers = 1`.
    pub stateful: bool,

    /// Route to a pool dedicated to this `(name, version)`
    pub isolated_pool: bool,

    /// Pool size when `isolated_pool` is set
    pub max_workers: usize,

    /// Hard execution timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,

    /// Opaque GPU placement hint, passed through untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,

    /// Kill the worker's whole process group on timeout
    pub kill_tree: bool,

    /// Seconds between SIGTERM and SIGKILL
    pub kill_grace_s: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::ProcessPool,
            stateful: false,
            isolated_pool: false,
            max_workers: 1,
            timeout_s: None,
            gpu: None,
            kill_tree: false,
            kill_grace_s: 1.0,
        }
    }
}

impl ExecutionConfig {
    /// Spec-level timeout as a [`Duration`], if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_s.map(Duration::from_secs_f64)
    }

    /// Kill grace as a [`Duration`].
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs_f64(self.kill_grace_s.max(0.0))
    }
}

/// Per-algorithm request/response logging policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Master switch for per-request logging
    pub enabled: bool,
    /// Include the input payload in the log record
    pub log_input: bool,
    /// Include the output payload in the log record
    pub log_output: bool,
    /// Only emit payload logs for failed requests
    pub on_error_only: bool,
    /// Truncate logged payloads to this many characters
    pub max_length: usize,
    /// Top-level payload fields to redact before logging
    pub redact_fields: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_input: false,
            log_output: false,
            on_error_only: false,
            max_length: 2048,
            redact_fields: Vec::new(),
        }
    }
}

/// Immutable descriptor of a registered algorithm.
#[derive(Clone)]
pub struct AlgorithmSpec {
    /// Algorithm name; primary key together with `version`
    pub name: String,
    /// Algorithm version
    pub version: String,
    /// Optional human description
    pub description: Option<String>,
    /// Categorization
    pub algorithm_type: AlgorithmType,
    /// Creation date, `YYYY-MM-DD`
    pub created_time: String,
    /// Author, non-empty
    pub author: String,
    /// Category, non-empty
    pub category: String,
    /// Optional scenario description
    pub application_scenarios: Option<String>,
    /// Arbitrary string metadata
    pub extra: BTreeMap<String, String>,
    /// Execution hints
    pub execution: ExecutionConfig,
    /// Logging policy
    pub logging: LoggingConfig,

    pub(crate) input_schema: Value,
    pub(crate) output_schema: Value,
    pub(crate) hyperparams_schema: Option<Value>,
    pub(crate) entrypoint: Entrypoint,
    pub(crate) input_validator: Arc<jsonschema::Validator>,
}

impl AlgorithmSpec {
    /// Start building a spec for `(name, version)`.
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> SpecBuilder {
        SpecBuilder::new(name, version)
    }

    /// Primary key.
    pub fn key(&self) -> (&str, &str) {
        (&self.name, &self.version)
    }

    /// Key in `name@version` form, used as the cross-process entrypoint
    /// reference and the stateful instance-cache key.
    pub fn ref_key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// JSON schema of the input model (draft-07).
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// JSON schema of the output model (draft-07).
    pub fn output_schema(&self) -> &Value {
        &self.output_schema
    }

    /// JSON schema of the hyperparams model, when declared.
    pub fn hyperparams_schema(&self) -> Option<&Value> {
        self.hyperparams_schema.as_ref()
    }

    /// Whether the entrypoint is class-based.
    pub fn is_class(&self) -> bool {
        self.entrypoint.is_class()
    }

    /// Validate a payload against the declared input schema.
    pub fn validate_input(&self, data: &Value) -> Result<(), String> {
        let errors: Vec<String> = self
            .input_validator
            .iter_errors(data)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{e} (at {path})")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

impl fmt::Debug for AlgorithmSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmSpec")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("algorithm_type", &self.algorithm_type)
            .field("execution", &self.execution)
            .field("entrypoint", &self.entrypoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_config_defaults_match_contract() {
        let config = ExecutionConfig::default();
        assert_eq!(config.execution_mode, ExecutionMode::ProcessPool);
        assert!(!config.stateful);
        assert!(!config.isolated_pool);
        assert_eq!(config.max_workers, 1);
        assert!(config.timeout_s.is_none());
        assert!(!config.kill_tree);
    }

    #[test]
    fn execution_mode_uses_wire_names() {
        assert_eq!(
            serde_json::to_value(ExecutionMode::ProcessPool).unwrap(),
            json!("PROCESS_POOL")
        );
        let mode: ExecutionMode = serde_json::from_value(json!("IN_PROCESS")).unwrap();
        assert_eq!(mode, ExecutionMode::InProcess);
    }

    #[test]
    fn execution_config_wire_fields_are_camel_case() {
        let value = serde_json::to_value(ExecutionConfig {
            timeout_s: Some(5.0),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(value["timeoutS"], json!(5.0));
        assert_eq!(value["maxWorkers"], json!(1));
        assert_eq!(value["killGraceS"], json!(1.0));
    }
}
