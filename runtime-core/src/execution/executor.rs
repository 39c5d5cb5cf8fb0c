//! Executor backends
//!
//! Four backends share one submit contract: [`InlineExecutor`] for
//! development and `IN_PROCESS` specs, the shared [`pool::ProcessPoolExecutor`]
//! for the default path, [`IsolatedPoolExecutor`] for specs that must not
//! share workers, and [`DispatchingExecutor`] routing between them. The
//! dispatcher never executes user code itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::pool::{PoolConfig, ProcessPoolExecutor};
use super::{ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult};
use crate::context;
use crate::lifecycle::{LifecycleHook, LifecyclePhase, TransitionContext};
use crate::observability::ServiceMetrics;
use crate::settings::RuntimeSettings;
use crate::spec::{initialize_guarded, run_guarded, ErasedAlgorithm, ExecutionMode, RunFailure};

/// Common contract of all execution backends.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Bring the backend up; idempotent.
    async fn start(&self) -> crate::Result<()>;

    /// Stop the backend. `wait` lets in-flight work finish first.
    async fn shutdown(&self, wait: bool) -> crate::Result<()>;

    /// Readiness probe.
    fn is_started(&self) -> bool;

    /// Execute one request; failures are values, never panics.
    async fn submit(&self, request: ExecutionRequest) -> ExecutionResult;
}

// ---------------------------------------------------------------------------
// Inline
// ---------------------------------------------------------------------------

/// Executes user code in the calling process.
///
/// No hard timeout is possible here; `timeout_s` is advisory only. Intended
/// for development and for specs declaring `execution_mode = IN_PROCESS`.
#[derive(Default)]
pub struct InlineExecutor {
    started: AtomicBool,
    instances: tokio::sync::Mutex<HashMap<String, Box<dyn ErasedAlgorithm>>>,
}

impl InlineExecutor {
    /// Create an inline executor.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Executor for InlineExecutor {
    async fn start(&self) -> crate::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, _wait: bool) -> crate::Result<()> {
        self.started.store(false, Ordering::SeqCst);
        for (_, mut algorithm) in self.instances.lock().await.drain() {
            algorithm.shutdown();
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        if !self.is_started() {
            return ExecutionResult::rejected("executor is not started");
        }

        let stateful = request.spec.execution.stateful;
        let cache_key = request.spec.ref_key();
        let cached = if stateful {
            self.instances.lock().await.remove(&cache_key)
        } else {
            None
        };

        let started_at = Utc::now();
        let joined = tokio::task::spawn_blocking(move || {
            let _guard = context::install(
                Some(request.request_id.clone()),
                request.trace_id.clone(),
                request.context.clone(),
                Some(request.request_datetime),
            );

            let (mut algorithm, fresh) = match cached {
                Some(algorithm) => (algorithm, false),
                None => (request.spec.entrypoint.instantiate(), true),
            };

            let outcome = if fresh {
                match initialize_guarded(&mut algorithm) {
                    Ok(()) => run_guarded(&mut algorithm, &request.payload, request.hyperparams.as_ref()),
                    Err(failure) => Err(failure),
                }
            } else {
                run_guarded(&mut algorithm, &request.payload, request.hyperparams.as_ref())
            };
            if outcome.is_ok() {
                algorithm.after_run();
            }

            let response_meta = context::take_response_meta();

            let keep = if stateful {
                Some(algorithm)
            } else {
                algorithm.shutdown();
                None
            };
            (outcome, response_meta, keep)
        })
        .await;

        let ended_at = Utc::now();
        let (outcome, response_meta, keep) = match joined {
            Ok(parts) => parts,
            Err(e) => {
                return ExecutionResult::fail(ExecutionError::new(
                    ErrorKind::System,
                    format!("inline execution task failed: {e}"),
                ));
            }
        };

        if let Some(algorithm) = keep {
            self.instances.lock().await.insert(cache_key, algorithm);
        }

        let mut result = match outcome {
            Ok(data) => ExecutionResult::ok(data),
            Err(RunFailure::Validation(message)) => {
                ExecutionResult::fail(ExecutionError::new(ErrorKind::Validation, message))
            }
            Err(RunFailure::Runtime(message)) => {
                ExecutionResult::fail(ExecutionError::new(ErrorKind::Runtime, message))
            }
            Err(RunFailure::System(message)) => {
                ExecutionResult::fail(ExecutionError::new(ErrorKind::System, message))
            }
        };
        result.started_at = Some(started_at);
        result.ended_at = Some(ended_at);
        result.duration_ms = Some(
            (ended_at - started_at)
                .to_std()
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
        );
        result.response_meta = response_meta;
        result
    }
}

// ---------------------------------------------------------------------------
// Isolated pools
// ---------------------------------------------------------------------------

/// One supervised pool per `(name, version)`, created lazily on first use
/// and kept until shutdown.
pub struct IsolatedPoolExecutor {
    settings: RuntimeSettings,
    metrics: Option<Arc<ServiceMetrics>>,
    pools: tokio::sync::Mutex<HashMap<(String, String), Arc<ProcessPoolExecutor>>>,
    started: AtomicBool,
}

impl IsolatedPoolExecutor {
    /// Create the isolated-pool manager.
    pub fn new(settings: RuntimeSettings, metrics: Option<Arc<ServiceMetrics>>) -> Self {
        Self {
            settings,
            metrics,
            pools: tokio::sync::Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Executor for IsolatedPoolExecutor {
    async fn start(&self) -> crate::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, wait: bool) -> crate::Result<()> {
        self.started.store(false, Ordering::SeqCst);
        let pools: Vec<_> = self.pools.lock().await.drain().collect();
        for ((name, version), pool) in pools {
            info!(algorithm = %name, version = %version, "Shutting down isolated pool");
            pool.shutdown(wait).await?;
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        if !self.is_started() {
            return ExecutionResult::rejected("executor is not started");
        }

        let key = (request.spec.name.clone(), request.spec.version.clone());
        let pool = {
            let mut pools = self.pools.lock().await;
            match pools.get(&key) {
                Some(pool) => Arc::clone(pool),
                None => {
                    let config = PoolConfig::isolated(
                        request.spec.ref_key(),
                        request.spec.execution.max_workers,
                        &self.settings,
                    );
                    let pool =
                        Arc::new(ProcessPoolExecutor::new(config, self.metrics.clone()));
                    if let Err(e) = pool.start().await {
                        return ExecutionResult::fail(ExecutionError::new(
                            ErrorKind::System,
                            format!("failed to start isolated pool: {e}"),
                        ));
                    }
                    pools.insert(key, Arc::clone(&pool));
                    pool
                }
            }
        };

        pool.submit(request).await
    }
}

// ---------------------------------------------------------------------------
// Shared pool as an Executor
// ---------------------------------------------------------------------------

#[async_trait]
impl Executor for ProcessPoolExecutor {
    async fn start(&self) -> crate::Result<()> {
        ProcessPoolExecutor::start(self).await
    }

    async fn shutdown(&self, wait: bool) -> crate::Result<()> {
        ProcessPoolExecutor::shutdown(self, wait).await
    }

    fn is_started(&self) -> bool {
        ProcessPoolExecutor::is_started(self)
    }

    async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        ProcessPoolExecutor::submit(self, request).await
    }
}

// ---------------------------------------------------------------------------
// Dispatching
// ---------------------------------------------------------------------------

/// Thin router over the three concrete backends.
pub struct DispatchingExecutor {
    inline: InlineExecutor,
    shared: ProcessPoolExecutor,
    isolated: IsolatedPoolExecutor,
}

impl DispatchingExecutor {
    /// Build the standard backend set from runtime settings.
    pub fn new(settings: &RuntimeSettings, metrics: Option<Arc<ServiceMetrics>>) -> Self {
        Self {
            inline: InlineExecutor::new(),
            shared: ProcessPoolExecutor::new(PoolConfig::shared(settings), metrics.clone()),
            isolated: IsolatedPoolExecutor::new(settings.clone(), metrics),
        }
    }

    fn route(&self, request: &ExecutionRequest) -> &dyn Executor {
        let execution = &request.spec.execution;
        if execution.execution_mode == ExecutionMode::InProcess {
            &self.inline
        } else if execution.isolated_pool {
            &self.isolated
        } else {
            &self.shared
        }
    }
}

#[async_trait]
impl Executor for DispatchingExecutor {
    async fn start(&self) -> crate::Result<()> {
        self.inline.start().await?;
        self.shared.start().await?;
        self.isolated.start().await?;
        Ok(())
    }

    async fn shutdown(&self, wait: bool) -> crate::Result<()> {
        // Stop routing targets before the shared pool so isolated drains do
        // not race replacement spawns.
        self.isolated.shutdown(wait).await?;
        self.shared.shutdown(wait).await?;
        self.inline.shutdown(wait).await?;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.inline.is_started() && self.shared.is_started() && self.isolated.is_started()
    }

    async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        self.route(&request).submit(request).await
    }
}

// ---------------------------------------------------------------------------
// Lifecycle wiring
// ---------------------------------------------------------------------------

/// Lifecycle hook that starts the executor on `ready` and drains it on
/// `draining`.
pub struct ExecutorLifecycleHook {
    executor: Arc<dyn Executor>,
}

impl ExecutorLifecycleHook {
    /// Wrap an executor for lifecycle attachment.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl LifecycleHook for ExecutorLifecycleHook {
    fn can_handle(&self, phase: LifecyclePhase) -> bool {
        matches!(phase, LifecyclePhase::Ready | LifecyclePhase::Draining)
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn before(&self, ctx: &TransitionContext) -> crate::Result<()> {
        match ctx.phase {
            LifecyclePhase::Ready => self.executor.start().await,
            LifecyclePhase::Draining => self.executor.shutdown(true).await,
            _ => Ok(()),
        }
    }
}
