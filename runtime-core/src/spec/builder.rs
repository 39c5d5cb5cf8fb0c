//! Spec builder and registration-time validation

use std::collections::BTreeMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::algorithm::{Algorithm, Entrypoint, HyperParams};
use super::{AlgorithmSpec, AlgorithmType, ExecutionConfig, ExecutionMode, LoggingConfig};
use crate::{Error, Result};

fn schema_value<T: JsonSchema>() -> Value {
    let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// Builder producing validated [`AlgorithmSpec`]s.
///
/// This is the registration descriptor: everything the Python-era decorator
/// collected is declared here explicitly, and `build` runs the same checks
/// the decorator ran so a bad declaration never reaches the registry.
pub struct SpecBuilder {
    name: String,
    version: String,
    description: Option<String>,
    algorithm_type: AlgorithmType,
    created_time: Option<String>,
    author: Option<String>,
    category: Option<String>,
    application_scenarios: Option<String>,
    extra: BTreeMap<String, String>,
    execution: ExecutionConfig,
    logging: LoggingConfig,
    io: Option<IoDeclaration>,
}

struct IoDeclaration {
    input_schema: Value,
    output_schema: Value,
    hyperparams_schema: Option<Value>,
    entrypoint: Entrypoint,
}

impl SpecBuilder {
    pub(crate) fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            algorithm_type: AlgorithmType::Prediction,
            created_time: None,
            author: None,
            category: None,
            application_scenarios: None,
            extra: BTreeMap::new(),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
            io: None,
        }
    }

    /// Set the human description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the algorithm type (defaults to `Prediction`).
    pub fn algorithm_type(mut self, algorithm_type: AlgorithmType) -> Self {
        self.algorithm_type = algorithm_type;
        self
    }

    /// Set the required creation date (`YYYY-MM-DD`).
    pub fn created_time(mut self, created_time: impl Into<String>) -> Self {
        self.created_time = Some(created_time.into());
        self
    }

    /// Set the required author.
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Set the required category.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the optional application scenarios text.
    pub fn application_scenarios(mut self, scenarios: impl Into<String>) -> Self {
        self.application_scenarios = Some(scenarios.into());
        self
    }

    /// Attach one `extra` metadata entry.
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Replace the execution config wholesale.
    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Set the hard execution timeout in seconds.
    pub fn timeout_secs(mut self, timeout_s: f64) -> Self {
        self.execution.timeout_s = Some(timeout_s);
        self
    }

    /// Set the worker count for isolated pools.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.execution.max_workers = max_workers;
        self
    }

    /// Mark the algorithm stateful (one cached instance per worker).
    pub fn stateful(mut self, stateful: bool) -> Self {
        self.execution.stateful = stateful;
        self
    }

    /// Route this algorithm to a dedicated pool.
    pub fn isolated_pool(mut self, isolated: bool) -> Self {
        self.execution.isolated_pool = isolated;
        self
    }

    /// Select the execution backend.
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution.execution_mode = mode;
        self
    }

    /// Replace the logging config.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Use a class entrypoint constructed via `Default`.
    pub fn class<A>(self) -> Self
    where
        A: Algorithm + Default,
    {
        self.class_with(A::default)
    }

    /// Use a class entrypoint with an explicit factory.
    pub fn class_with<A, F>(mut self, factory: F) -> Self
    where
        A: Algorithm,
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.io = Some(IoDeclaration {
            input_schema: schema_value::<A::Input>(),
            output_schema: schema_value::<A::Output>(),
            hyperparams_schema: if A::Params::DECLARED {
                Some(schema_value::<A::Params>())
            } else {
                None
            },
            entrypoint: Entrypoint::from_class(factory),
        });
        self
    }

    /// Use a stateless function entrypoint.
    pub fn function<I, O, F>(mut self, f: F) -> Self
    where
        I: DeserializeOwned + Serialize + JsonSchema + Send + 'static,
        O: Serialize + JsonSchema + Send + 'static,
        F: Fn(I) -> Result<O> + Send + Sync + 'static,
    {
        self.io = Some(IoDeclaration {
            input_schema: schema_value::<I>(),
            output_schema: schema_value::<O>(),
            hyperparams_schema: None,
            entrypoint: Entrypoint::from_function(f),
        });
        self
    }

    /// Validate the declaration and produce the immutable spec.
    pub fn build(self) -> Result<AlgorithmSpec> {
        let invalid = |msg: String| Error::Validation(msg);

        if self.name.trim().is_empty() || self.version.trim().is_empty() {
            return Err(invalid("name and version are required".into()));
        }

        let created_time = self
            .created_time
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("created_time is required".into()))?
            .to_string();
        validate_created_time(&created_time)?;

        let author = required_trimmed(self.author.as_deref(), "author")?;
        let category = required_trimmed(self.category.as_deref(), "category")?;

        let application_scenarios = match self.application_scenarios.as_deref().map(str::trim) {
            Some("") => {
                return Err(invalid("application_scenarios must be non-empty when set".into()))
            }
            Some(s) => Some(s.to_string()),
            None => None,
        };

        if self.execution.max_workers < 1 {
            return Err(invalid("max_workers must be at least 1".into()));
        }
        if let Some(t) = self.execution.timeout_s {
            if !t.is_finite() || t <= 0.0 {
                return Err(invalid("timeout_s must be a positive number".into()));
            }
        }
        if !self.execution.kill_grace_s.is_finite() || self.execution.kill_grace_s < 0.0 {
            return Err(invalid("kill_grace_s must be non-negative".into()));
        }

        let io = self
            .io
            .ok_or_else(|| invalid("an entrypoint (class or function) is required".into()))?;

        if self.execution.stateful && !io.entrypoint.is_class() {
            return Err(invalid(
                "stateful execution requires a class entrypoint".into(),
            ));
        }

        // Registration smoke test: a schema that does not compile would
        // otherwise only fail on the first request.
        let input_validator = jsonschema::draft7::new(&io.input_schema)
            .map_err(|e| invalid(format!("input schema failed to compile: {e}")))?;
        jsonschema::draft7::new(&io.output_schema)
            .map_err(|e| invalid(format!("output schema failed to compile: {e}")))?;
        if let Some(schema) = &io.hyperparams_schema {
            jsonschema::draft7::new(schema)
                .map_err(|e| invalid(format!("hyperparams schema failed to compile: {e}")))?;
        }

        Ok(AlgorithmSpec {
            name: self.name,
            version: self.version,
            description: self.description,
            algorithm_type: self.algorithm_type,
            created_time,
            author,
            category,
            application_scenarios,
            extra: self.extra,
            execution: self.execution,
            logging: self.logging,
            input_schema: io.input_schema,
            output_schema: io.output_schema,
            hyperparams_schema: io.hyperparams_schema,
            entrypoint: io.entrypoint,
            input_validator: Arc::new(input_validator),
        })
    }
}

fn required_trimmed(value: Option<&str>, field: &str) -> Result<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("{field} is required")))
}

fn validate_created_time(value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit());
    if !shape_ok {
        return Err(Error::Validation(
            "created_time must be in YYYY-MM-DD format".into(),
        ));
    }
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| Error::Validation("created_time must be a valid date".into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::NoParams;
    use serde_json::json;

    #[derive(serde::Serialize, serde::Deserialize, JsonSchema)]
    struct In {
        value: i64,
    }

    #[derive(serde::Serialize, JsonSchema)]
    struct Out {
        doubled: i64,
    }

    fn base_builder() -> SpecBuilder {
        AlgorithmSpec::builder("double", "v1")
            .created_time("2026-01-01")
            .author("qa")
            .category("unit")
            .function(|req: In| {
                Ok(Out {
                    doubled: req.value * 2,
                })
            })
    }

    #[test]
    fn builds_a_valid_spec() {
        let spec = base_builder().timeout_secs(5.0).build().unwrap();
        assert_eq!(spec.key(), ("double", "v1"));
        assert_eq!(spec.ref_key(), "double@v1");
        assert_eq!(spec.execution.timeout_s, Some(5.0));
        assert!(!spec.is_class());
        assert!(spec.hyperparams_schema().is_none());
    }

    #[test]
    fn input_schema_validates_payloads() {
        let spec = base_builder().build().unwrap();
        spec.validate_input(&json!({"value": 21})).unwrap();
        assert!(spec.validate_input(&json!({"value": "nope"})).is_err());
    }

    #[test]
    fn created_time_must_be_a_real_date() {
        for bad in ["2026-13-01", "2026-1-1", "not-a-date", "2026-02-30"] {
            let err = AlgorithmSpec::builder("a", "v1")
                .created_time(bad)
                .author("qa")
                .category("unit")
                .function(|req: In| Ok(Out { doubled: req.value }))
                .build()
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "accepted {bad}");
        }
    }

    #[test]
    fn missing_metadata_is_rejected() {
        let err = AlgorithmSpec::builder("a", "v1")
            .created_time("2026-01-01")
            .category("unit")
            .function(|req: In| Ok(Out { doubled: req.value }))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("author"));
    }

    #[test]
    fn stateful_function_is_rejected() {
        let err = base_builder().stateful(true).build().unwrap_err();
        assert!(err.to_string().contains("class entrypoint"));
    }

    #[test]
    fn declared_hyperparams_get_a_schema() {
        #[derive(serde::Deserialize, JsonSchema)]
        struct Knobs {
            #[allow(dead_code)]
            factor: i64,
        }
        impl HyperParams for Knobs {}

        #[derive(Default)]
        struct WithKnobs;
        impl Algorithm for WithKnobs {
            type Input = In;
            type Output = Out;
            type Params = Knobs;
            fn run(&mut self, req: In, params: Option<Knobs>) -> Result<Out> {
                let factor = params.map(|p| p.factor).unwrap_or(2);
                Ok(Out {
                    doubled: req.value * factor,
                })
            }
        }

        let spec = AlgorithmSpec::builder("knobs", "v1")
            .created_time("2026-01-01")
            .author("qa")
            .category("unit")
            .class::<WithKnobs>()
            .build()
            .unwrap();
        assert!(spec.hyperparams_schema().is_some());
        assert!(spec.is_class());
    }

    #[test]
    fn params_are_ignored_when_undeclared() {
        let spec = base_builder().build().unwrap();
        // NoParams marker: schema endpoint reports nothing to configure.
        assert!(!NoParams::DECLARED);
        assert!(spec.hyperparams_schema().is_none());
    }
}
