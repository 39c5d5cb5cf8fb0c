//! YAML override behavior against a live registry

use algoserve_runtime_core::registry::AlgorithmRegistry;
use algoserve_runtime_core::spec::{Algorithm, AlgorithmSpec, LoggingConfig, NoParams};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, JsonSchema)]
struct Req {
    value: i64,
}

#[derive(Serialize, JsonSchema)]
struct Resp {
    doubled: i64,
}

#[derive(Default)]
struct Demo;

impl Algorithm for Demo {
    type Input = Req;
    type Output = Resp;
    type Params = NoParams;

    fn run(&mut self, req: Req, _params: Option<NoParams>) -> algoserve_runtime_core::Result<Resp> {
        Ok(Resp {
            doubled: req.value * 2,
        })
    }
}

fn demo_spec() -> AlgorithmSpec {
    AlgorithmSpec::builder("demo", "v1")
        .description("orig")
        .created_time("2026-01-06")
        .author("qa")
        .category("unit")
        .application_scenarios("demo")
        .extra("owner", "unit")
        .timeout_secs(10.0)
        .logging(LoggingConfig {
            enabled: false,
            ..Default::default()
        })
        .class::<Demo>()
        .build()
        .unwrap()
}

fn write(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

#[test]
fn load_config_overrides_existing_spec() {
    let dir = tempfile::tempdir().unwrap();
    let registry = AlgorithmRegistry::new();
    registry.register(demo_spec()).unwrap();

    write(
        dir.path(),
        "a.algometa.yaml",
        r#"
- name: demo
  version: v1
  category: unit
  algorithmType: Prediction
  description: override
  createdTime: "2026-02-01"
  author: ml-team
  applicationScenarios: offline
  extra:
    owner: override
  logging:
    enabled: true
    logOutput: true
  execution:
    timeoutS: 1
"#,
    );

    registry.load_config(dir.path()).unwrap();

    let spec = registry.get("demo", "v1").unwrap();
    assert_eq!(spec.description.as_deref(), Some("override"));
    assert_eq!(spec.created_time, "2026-02-01");
    assert_eq!(spec.author, "ml-team");
    assert_eq!(spec.application_scenarios.as_deref(), Some("offline"));
    assert_eq!(spec.extra.get("owner").map(String::as_str), Some("override"));
    assert!(spec.logging.enabled);
    assert!(spec.logging.log_output);
    assert_eq!(spec.execution.timeout_s, Some(1.0));
    // Match keys and unrelated fields are untouched.
    assert_eq!(spec.category, "unit");
    assert_eq!(spec.execution.max_workers, 1);
}

#[test]
fn overrides_apply_to_specs_registered_afterwards() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.algometa.yaml",
        r#"
- name: demo
  version: v1
  category: unit
  algorithmType: Prediction
  description: override
"#,
    );

    let registry = AlgorithmRegistry::new();
    registry.load_config(dir.path()).unwrap();
    registry.register(demo_spec()).unwrap();

    let spec = registry.get("demo", "v1").unwrap();
    assert_eq!(spec.description.as_deref(), Some("override"));
}

#[test]
fn later_files_win_in_lexical_order() {
    let dir = tempfile::tempdir().unwrap();
    let registry = AlgorithmRegistry::new();
    registry.register(demo_spec()).unwrap();

    write(
        dir.path(),
        "a.algometa.yaml",
        r#"
- name: demo
  version: v1
  category: unit
  algorithmType: Prediction
  description: first
"#,
    );
    write(
        dir.path(),
        "b.algometa.yaml",
        r#"
- name: demo
  version: v1
  category: unit
  algorithmType: Prediction
  description: second
"#,
    );

    registry.load_config(dir.path()).unwrap();
    let spec = registry.get("demo", "v1").unwrap();
    assert_eq!(spec.description.as_deref(), Some("second"));
}

#[test]
fn mismatched_keys_do_not_apply() {
    let dir = tempfile::tempdir().unwrap();
    let registry = AlgorithmRegistry::new();
    registry.register(demo_spec()).unwrap();

    write(
        dir.path(),
        "a.algometa.yaml",
        r#"
- name: demo
  version: v1
  category: other-category
  algorithmType: Prediction
  description: should-not-apply
"#,
    );

    registry.load_config(dir.path()).unwrap();
    let spec = registry.get("demo", "v1").unwrap();
    assert_eq!(spec.description.as_deref(), Some("orig"));
}

#[test]
fn malformed_entries_are_skipped_but_valid_ones_load() {
    let dir = tempfile::tempdir().unwrap();
    let registry = AlgorithmRegistry::new();
    registry.register(demo_spec()).unwrap();

    write(
        dir.path(),
        "a.algometa.yaml",
        r#"
- name: demo
  version: v1
  category: unit
  algorithmType: Prediction
  unknownKey: boom
- name: demo
  version: v1
  category: unit
  algorithmType: Prediction
  createdTime: not-a-date
- name: demo
  version: v1
  category: unit
  algorithmType: Prediction
  description: survivor
"#,
    );

    let loaded = registry.load_config(dir.path()).unwrap();
    assert_eq!(loaded, 1, "only the valid entry is retained");
    let spec = registry.get("demo", "v1").unwrap();
    assert_eq!(spec.description.as_deref(), Some("survivor"));
    assert_eq!(spec.created_time, "2026-01-06");
}

#[test]
fn non_algometa_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let registry = AlgorithmRegistry::new();
    registry.register(demo_spec()).unwrap();

    write(
        dir.path(),
        "notes.yaml",
        r#"
- name: demo
  version: v1
  category: unit
  algorithmType: Prediction
  description: should-not-load
"#,
    );

    let loaded = registry.load_config(dir.path()).unwrap();
    assert_eq!(loaded, 0);
    assert_eq!(
        registry.get("demo", "v1").unwrap().description.as_deref(),
        Some("orig")
    );
}
