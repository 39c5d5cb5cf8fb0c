//! Algorithm execution server
//!
//! Deployable shell around the runtime: loads configuration from the
//! environment (and an optional .env file), assembles the registry, wires
//! the executor into the lifecycle state machine, and serves the HTTP API.
//!
//! Algorithm packages are statically linked: a deployment builds its own
//! binary that registers packages in [`build_registry`] before handing the
//! registry to the runtime. This stock binary ships with an empty catalog
//! and is mainly useful for wiring checks and as a template.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use algoserve_http::{AlgorithmHttpService, HttpServer};
use algoserve_runtime_core::execution::{DispatchingExecutor, Executor, ExecutorLifecycleHook};
use algoserve_runtime_core::lifecycle::ServiceRuntime;
use algoserve_runtime_core::observability::ServiceMetrics;
use algoserve_runtime_core::registry::AlgorithmRegistry;
use algoserve_runtime_core::settings::RuntimeSettings;
use algoserve_runtime_core::worker;

#[derive(Debug, Parser)]
#[command(name = "algoserve-server", about = "Algorithm execution server")]
struct Args {
    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Listener host, overriding SERVICE_BIND_HOST
    #[arg(long)]
    bind: Option<String>,

    /// Listener port, overriding SERVICE_PORT
    #[arg(long)]
    port: Option<u16>,

    /// Metadata override directory, overriding ALGO_METADATA_CONFIG_DIR
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

/// Assemble the algorithm catalog for this deployment.
///
/// Linked algorithm packages register here via
/// `registry.load_packages(&[&package, ...])`.
fn build_registry() -> AlgorithmRegistry {
    AlgorithmRegistry::new()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    let registry = Arc::new(build_registry());

    // Pool workers are this binary re-entered with a marker env var; the
    // check must run before any server machinery comes up.
    if worker::maybe_run_worker(&registry) {
        return Ok(());
    }

    let mut settings = RuntimeSettings::from_env().context("invalid configuration")?;
    if let Some(bind) = args.bind {
        settings.bind_host = bind;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(config_dir) = args.config_dir {
        settings.metadata_config_dir = Some(config_dir);
    }

    algoserve_runtime_core::init()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(serve(settings, registry))
}

async fn serve(settings: RuntimeSettings, registry: Arc<AlgorithmRegistry>) -> anyhow::Result<()> {
    let metrics = Arc::new(
        ServiceMetrics::with_default_registry().context("failed to register metrics")?,
    );
    let executor: Arc<dyn Executor> = Arc::new(DispatchingExecutor::new(
        &settings,
        Some(Arc::clone(&metrics)),
    ));

    let lifecycle = Arc::new(ServiceRuntime::new());
    lifecycle.add_hook(Arc::new(ExecutorLifecycleHook::new(Arc::clone(&executor))));

    lifecycle.provisioning(Some("startup")).await?;
    if let Some(dir) = &settings.metadata_config_dir {
        let loaded = registry
            .load_config(dir)
            .with_context(|| format!("failed to load overrides from {}", dir.display()))?;
        tracing::info!(dir = %dir.display(), entries = loaded, "Applied metadata overrides");
    }
    lifecycle.ready(Some("startup")).await?;
    lifecycle.running(Some("startup")).await?;

    let service = Arc::new(AlgorithmHttpService::new(
        Arc::clone(&registry),
        Arc::clone(&executor),
        Some(Arc::clone(&metrics)),
    ));
    let server = HttpServer::new(
        settings,
        service,
        Arc::clone(&lifecycle),
        Arc::clone(&metrics),
    );

    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // The draining hook waits for in-flight executions before workers stop.
    lifecycle.draining(Some("shutdown")).await?;
    lifecycle.stop(Some("shutdown")).await?;
    Ok(())
}
