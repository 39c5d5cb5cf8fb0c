//! Algorithm registry
//!
//! Exclusive-ownership catalog keyed by `(name, version)`. The registry is
//! written during startup (package loading, YAML overrides) and read-only in
//! steady state, so lookups take a shared lock and never block execution.

mod overrides;

pub use overrides::{ExecutionOverride, LoggingOverride, OverrideEntry};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::spec::AlgorithmSpec;
use crate::{Error, Result};

/// A statically linked bundle of algorithm declarations.
///
/// This is the Rust counterpart of a loadable algorithm package: the
/// package's public-export list is whatever `specs` returns. Individual
/// declarations may fail to build; the registry skips those with a warning
/// instead of rejecting the whole package.
pub trait AlgorithmPackage: Send + Sync {
    /// Package name, used in diagnostics.
    fn name(&self) -> &str;

    /// The specs this package exports.
    fn specs(&self) -> Vec<Result<AlgorithmSpec>>;
}

/// In-memory registry for algorithms.
#[derive(Default)]
pub struct AlgorithmRegistry {
    items: RwLock<HashMap<(String, String), Arc<AlgorithmSpec>>>,
    overrides: RwLock<Vec<OverrideEntry>>,
}

impl AlgorithmRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec; fails if `(name, version)` is already present.
    ///
    /// Any retained YAML overrides matching the spec are applied before
    /// insertion, so `load_config` ordering relative to registration does not
    /// change the outcome.
    pub fn register(&self, spec: AlgorithmSpec) -> Result<()> {
        let spec = {
            let overrides = self.overrides.read().unwrap_or_else(|e| e.into_inner());
            overrides::apply_all(&overrides, spec)
        };

        let key = (spec.name.clone(), spec.version.clone());
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        if items.contains_key(&key) {
            return Err(Error::Registration(format!(
                "algorithm already registered: {} ({})",
                key.0, key.1
            )));
        }
        info!(name = %key.0, version = %key.1, "Registered algorithm");
        items.insert(key, Arc::new(spec));
        Ok(())
    }

    /// Look up a spec by `(name, version)`.
    pub fn get(&self, name: &str, version: &str) -> Result<Arc<AlgorithmSpec>> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("algorithm not found: {name} ({version})")))
    }

    /// All registered specs, ordered by key for deterministic listings.
    pub fn list(&self) -> Vec<Arc<AlgorithmSpec>> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        let mut specs: Vec<_> = items.values().cloned().collect();
        specs.sort_by(|a, b| a.key().cmp(&b.key()));
        specs
    }

    /// Number of registered specs.
    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every spec exported by the given packages, in order.
    ///
    /// Declarations that fail to build and keys that are already taken are
    /// skipped with a warning; the count of successful registrations is
    /// returned.
    pub fn load_packages(&self, packages: &[&dyn AlgorithmPackage]) -> usize {
        let mut registered = 0;
        for package in packages {
            for spec in package.specs() {
                match spec {
                    Ok(spec) => {
                        let key = format!("{} ({})", spec.name, spec.version);
                        match self.register(spec) {
                            Ok(()) => registered += 1,
                            Err(e) => {
                                warn!(package = package.name(), algorithm = %key, error = %e,
                                      "Skipping algorithm export");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(package = package.name(), error = %e,
                              "Skipping invalid algorithm export");
                    }
                }
            }
        }
        registered
    }

    /// Load `*.algometa.yaml` override files from a directory.
    ///
    /// Files are processed in lexical order, entries in file order; later
    /// matches win. The resulting table replaces any previously loaded one,
    /// is applied to already-registered specs immediately, and is retained so
    /// future registrations pick it up as well. Malformed files and entries
    /// are skipped with a warning.
    pub fn load_config(&self, dir: &Path) -> Result<usize> {
        let entries = overrides::load_dir(dir)?;
        let count = entries.len();

        {
            let mut table = self.overrides.write().unwrap_or_else(|e| e.into_inner());
            *table = entries;
        }

        let table = self.overrides.read().unwrap_or_else(|e| e.into_inner());
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        for spec in items.values_mut() {
            let updated = overrides::apply_all(&table, spec.as_ref().clone());
            *spec = Arc::new(updated);
        }

        info!(dir = %dir.display(), entries = count, "Loaded algorithm metadata overrides");
        Ok(count)
    }
}
