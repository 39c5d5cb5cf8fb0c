//! YAML metadata overrides
//!
//! Operators drop `*.algometa.yaml` files next to a deployment to adjust
//! non-key spec fields without touching code. Each entry names its target via
//! four required match keys; everything else is an optional override. Match
//! keys are never applied.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::spec::{AlgorithmSpec, AlgorithmType};
use crate::Result;

/// One override entry from an `*.algometa.yaml` file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OverrideEntry {
    /// Match key: algorithm name
    pub name: String,
    /// Match key: algorithm version
    pub version: String,
    /// Match key: category
    pub category: String,
    /// Match key: algorithm type
    pub algorithm_type: AlgorithmType,

    /// Override for `description`
    #[serde(default)]
    pub description: Option<String>,
    /// Override for `created_time` (validated `YYYY-MM-DD`)
    #[serde(default)]
    pub created_time: Option<String>,
    /// Override for `author`
    #[serde(default)]
    pub author: Option<String>,
    /// Override for `application_scenarios`
    #[serde(default)]
    pub application_scenarios: Option<String>,
    /// Replacement for the `extra` metadata map
    #[serde(default)]
    pub extra: Option<BTreeMap<String, String>>,
    /// Partial logging override
    #[serde(default)]
    pub logging: Option<LoggingOverride>,
    /// Partial execution override
    #[serde(default)]
    pub execution: Option<ExecutionOverride>,
}

/// Partial override of [`crate::spec::LoggingConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggingOverride {
    /// Override for `enabled`
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Override for `log_input`
    #[serde(default)]
    pub log_input: Option<bool>,
    /// Override for `log_output`
    #[serde(default)]
    pub log_output: Option<bool>,
    /// Override for `on_error_only`
    #[serde(default)]
    pub on_error_only: Option<bool>,
    /// Override for `max_length`
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Override for `redact_fields`
    #[serde(default)]
    pub redact_fields: Option<Vec<String>>,
}

/// Partial override of [`crate::spec::ExecutionConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecutionOverride {
    /// Override for `stateful`
    #[serde(default)]
    pub stateful: Option<bool>,
    /// Override for `isolated_pool`
    #[serde(default)]
    pub isolated_pool: Option<bool>,
    /// Override for `max_workers`
    #[serde(default)]
    pub max_workers: Option<usize>,
    /// Override for `timeout_s`
    #[serde(default)]
    pub timeout_s: Option<f64>,
    /// Override for `gpu`
    #[serde(default)]
    pub gpu: Option<String>,
    /// Override for `kill_tree`
    #[serde(default)]
    pub kill_tree: Option<bool>,
    /// Override for `kill_grace_s`
    #[serde(default)]
    pub kill_grace_s: Option<f64>,
}

impl OverrideEntry {
    fn matches(&self, spec: &AlgorithmSpec) -> bool {
        self.name == spec.name
            && self.version == spec.version
            && self.category == spec.category
            && self.algorithm_type == spec.algorithm_type
    }

    fn apply(&self, spec: &mut AlgorithmSpec) {
        if let Some(description) = &self.description {
            spec.description = Some(description.clone());
        }
        if let Some(created_time) = &self.created_time {
            spec.created_time = created_time.clone();
        }
        if let Some(author) = &self.author {
            spec.author = author.clone();
        }
        if let Some(scenarios) = &self.application_scenarios {
            spec.application_scenarios = Some(scenarios.clone());
        }
        if let Some(extra) = &self.extra {
            spec.extra = extra.clone();
        }
        if let Some(logging) = &self.logging {
            let target = &mut spec.logging;
            if let Some(v) = logging.enabled {
                target.enabled = v;
            }
            if let Some(v) = logging.log_input {
                target.log_input = v;
            }
            if let Some(v) = logging.log_output {
                target.log_output = v;
            }
            if let Some(v) = logging.on_error_only {
                target.on_error_only = v;
            }
            if let Some(v) = logging.max_length {
                target.max_length = v;
            }
            if let Some(v) = &logging.redact_fields {
                target.redact_fields = v.clone();
            }
        }
        if let Some(execution) = &self.execution {
            let target = &mut spec.execution;
            if let Some(v) = execution.stateful {
                target.stateful = v;
            }
            if let Some(v) = execution.isolated_pool {
                target.isolated_pool = v;
            }
            if let Some(v) = execution.max_workers {
                target.max_workers = v;
            }
            if let Some(v) = execution.timeout_s {
                target.timeout_s = Some(v);
            }
            if let Some(v) = &execution.gpu {
                target.gpu = Some(v.clone());
            }
            if let Some(v) = execution.kill_tree {
                target.kill_tree = v;
            }
            if let Some(v) = execution.kill_grace_s {
                target.kill_grace_s = v;
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(created_time) = &self.created_time {
            if chrono::NaiveDate::parse_from_str(created_time, "%Y-%m-%d").is_err()
                || created_time.len() != 10
            {
                return Err(format!("invalid createdTime: {created_time}"));
            }
        }
        if let Some(execution) = &self.execution {
            if execution.max_workers == Some(0) {
                return Err("maxWorkers must be at least 1".into());
            }
            if let Some(t) = execution.timeout_s {
                if !t.is_finite() || t <= 0.0 {
                    return Err("timeoutS must be a positive number".into());
                }
            }
            if let Some(g) = execution.kill_grace_s {
                if !g.is_finite() || g < 0.0 {
                    return Err("killGraceS must be non-negative".into());
                }
            }
        }
        Ok(())
    }
}

/// Apply every matching entry to `spec`, in table order (later matches win).
pub(super) fn apply_all(entries: &[OverrideEntry], mut spec: AlgorithmSpec) -> AlgorithmSpec {
    let matching: Vec<&OverrideEntry> = entries.iter().filter(|e| e.matches(&spec)).collect();
    for entry in matching {
        entry.apply(&mut spec);
    }
    spec
}

/// Load all override entries from `dir`, in lexical file order.
pub(super) fn load_dir(dir: &Path) -> Result<Vec<OverrideEntry>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".algometa.yaml"))
        })
        .collect();
    paths.sort();

    let mut entries = Vec::new();
    for path in paths {
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read override file");
                continue;
            }
        };
        let raw: Vec<serde_yaml::Value> = match serde_yaml::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse override file");
                continue;
            }
        };
        for (index, value) in raw.into_iter().enumerate() {
            match serde_yaml::from_value::<OverrideEntry>(value) {
                Ok(entry) => match entry.validate() {
                    Ok(()) => entries.push(entry),
                    Err(e) => {
                        warn!(path = %path.display(), index, error = %e,
                              "Skipping invalid override entry");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), index, error = %e,
                          "Skipping malformed override entry");
                }
            }
        }
    }
    Ok(entries)
}
