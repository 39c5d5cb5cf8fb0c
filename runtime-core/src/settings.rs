//! Environment-derived runtime settings
//!
//! Mirrors the deployment contract: every knob has an `ALGO_*`, `EXECUTOR_*`
//! or `SERVICE_*` environment variable, and unset variables fall back to
//! conservative defaults. Parsing is strict; a malformed value is a
//! configuration error rather than a silent default.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Runtime configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Listener host (`SERVICE_BIND_HOST`)
    pub bind_host: String,
    /// Listener port (`SERVICE_PORT`)
    pub port: u16,
    /// Directory of `*.algometa.yaml` overrides (`ALGO_METADATA_CONFIG_DIR`)
    pub metadata_config_dir: Option<PathBuf>,
    /// Shared pool size (`EXECUTOR_GLOBAL_MAX_WORKERS`)
    pub global_max_workers: usize,
    /// Shared pool admission capacity (`EXECUTOR_GLOBAL_QUEUE_SIZE`)
    pub global_queue_size: usize,
    /// Admission wait before rejecting (`EXECUTOR_ADMIT_TIMEOUT_S`)
    pub admit_timeout: Duration,
    /// Fallback effective timeout (`EXECUTOR_DEFAULT_TIMEOUT_S`)
    pub default_timeout: Option<Duration>,
    /// SIGTERM → SIGKILL grace (`EXECUTOR_KILL_GRACE_S`)
    pub kill_grace: Duration,
    /// Kill the worker's process group (`EXECUTOR_KILL_TREE`)
    pub kill_tree: bool,
    /// Worker Ready-frame deadline (`EXECUTOR_SPAWN_TIMEOUT_S`)
    pub spawn_timeout: Duration,
    /// Admin lifecycle endpoints (`SERVICE_ADMIN_ENABLED`)
    pub admin_enabled: bool,
    /// CORS layer (`CORS_ENABLED`)
    pub cors_enabled: bool,
    /// Allowed CORS origins (`CORS_ALLOW_ORIGINS`, comma-separated)
    pub cors_allow_origins: Vec<String>,
    /// Docs UI gate (`SERVICE_SWAGGER_ENABLED`); consumed by an external
    /// docs layer, not by the core routes
    pub swagger_enabled: bool,
    /// Docs UI mount path (`SERVICE_SWAGGER_PATH`)
    pub swagger_path: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 8000,
            metadata_config_dir: None,
            global_max_workers: 4,
            global_queue_size: 16,
            admit_timeout: Duration::from_secs(1),
            default_timeout: None,
            kill_grace: Duration::from_secs(1),
            kill_tree: false,
            spawn_timeout: Duration::from_secs(30),
            admin_enabled: false,
            cors_enabled: false,
            cors_allow_origins: Vec::new(),
            swagger_enabled: false,
            swagger_path: "/docs".to_string(),
        }
    }
}

impl RuntimeSettings {
    /// Assemble settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind_host: env_string("SERVICE_BIND_HOST").unwrap_or(defaults.bind_host),
            port: env_parse("SERVICE_PORT")?.unwrap_or(defaults.port),
            metadata_config_dir: env_string("ALGO_METADATA_CONFIG_DIR").map(PathBuf::from),
            global_max_workers: env_parse("EXECUTOR_GLOBAL_MAX_WORKERS")?
                .map(|n: usize| n.max(1))
                .unwrap_or(defaults.global_max_workers),
            global_queue_size: env_parse("EXECUTOR_GLOBAL_QUEUE_SIZE")?
                .map(|n: usize| n.max(1))
                .unwrap_or(defaults.global_queue_size),
            admit_timeout: env_secs("EXECUTOR_ADMIT_TIMEOUT_S")?.unwrap_or(defaults.admit_timeout),
            default_timeout: env_secs("EXECUTOR_DEFAULT_TIMEOUT_S")?,
            kill_grace: env_secs("EXECUTOR_KILL_GRACE_S")?.unwrap_or(defaults.kill_grace),
            kill_tree: env_bool("EXECUTOR_KILL_TREE")?.unwrap_or(defaults.kill_tree),
            spawn_timeout: env_secs("EXECUTOR_SPAWN_TIMEOUT_S")?.unwrap_or(defaults.spawn_timeout),
            admin_enabled: env_bool("SERVICE_ADMIN_ENABLED")?.unwrap_or(defaults.admin_enabled),
            cors_enabled: env_bool("CORS_ENABLED")?.unwrap_or(defaults.cors_enabled),
            cors_allow_origins: env_list("CORS_ALLOW_ORIGINS"),
            swagger_enabled: env_bool("SERVICE_SWAGGER_ENABLED")?
                .unwrap_or(defaults.swagger_enabled),
            swagger_path: env_string("SERVICE_SWAGGER_PATH").unwrap_or(defaults.swagger_path),
        })
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw}"))),
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match env_parse::<f64>(name)? {
        None => Ok(None),
        Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
        Some(secs) => Err(Error::Config(format!(
            "invalid value for {name}: {secs} (must be non-negative seconds)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "n" | "off" => Ok(Some(false)),
            _ => Err(Error::Config(format!("invalid bool for {name}: {raw}"))),
        },
    }
}

fn env_list(name: &str) -> Vec<String> {
    env_string(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
