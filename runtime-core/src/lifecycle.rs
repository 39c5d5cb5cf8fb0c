//! Service lifecycle state machine
//!
//! The runtime moves through `initialized → provisioning → ready → running →
//! draining → stopped`, with `degraded` reachable from `running` and a
//! terminal `failed` sink for startup errors. Transitions are explicit and
//! serialized; illegal ones fail fast with a typed error.
//!
//! Hooks observe transitions: `before` hooks run in descending priority and
//! can block (and fail) a transition, `after` hooks run in reverse order and
//! never block. The executor's `start` is attached to `ready` and its
//! draining `shutdown` to `draining`, which is what gates the HTTP readiness
//! probe.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

/// Server-wide lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, nothing started
    Initialized,
    /// Loading registries and configuration
    Provisioning,
    /// Executors started, not yet serving
    Ready,
    /// Serving requests
    Running,
    /// Serving with reduced capacity
    Degraded,
    /// Rejecting new work, finishing in-flight requests
    Draining,
    /// Fully stopped (terminal)
    Stopped,
    /// Startup or transition failure (terminal)
    Failed,
}

impl ServiceState {
    /// Stable lowercase name for probes and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Initialized => "initialized",
            ServiceState::Provisioning => "provisioning",
            ServiceState::Ready => "ready",
            ServiceState::Running => "running",
            ServiceState::Degraded => "degraded",
            ServiceState::Draining => "draining",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        }
    }
}

/// The transition a hook is observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// → provisioning
    Provisioning,
    /// → ready
    Ready,
    /// → running
    Running,
    /// → degraded
    Degraded,
    /// → draining
    Draining,
    /// → stopped
    Stopped,
}

/// Lifecycle transition errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The machine is already in the requested state
    #[error("already in state {state}")]
    AlreadyInState {
        /// Current state name
        state: &'static str,
    },

    /// The requested transition is not legal from the current state
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Current state name
        from: &'static str,
        /// Requested state name
        to: &'static str,
    },

    /// A before-hook refused the transition; the machine is now `failed`
    #[error("lifecycle hook failed during {phase:?}: {message}")]
    HookFailed {
        /// Phase being entered
        phase: LifecyclePhase,
        /// Hook error message
        message: String,
    },
}

/// Context handed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Phase being entered
    pub phase: LifecyclePhase,
    /// State before the transition
    pub from: ServiceState,
    /// State after the transition
    pub to: ServiceState,
    /// Free-form reason supplied by the caller
    pub reason: Option<String>,
}

/// Observer of lifecycle transitions.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Whether this hook cares about `phase`.
    fn can_handle(&self, phase: LifecyclePhase) -> bool;

    /// Ordering weight; higher priority runs earlier in `before`.
    fn priority(&self) -> i32 {
        0
    }

    /// Runs before the state changes; an error blocks the transition and
    /// sends the machine to `failed`.
    async fn before(&self, _ctx: &TransitionContext) -> crate::Result<()> {
        Ok(())
    }

    /// Runs after the state changed (reverse order); failures are logged and
    /// never block.
    async fn after(&self, _ctx: &TransitionContext) -> crate::Result<()> {
        Ok(())
    }
}

/// Default lifecycle state machine.
pub struct ServiceRuntime {
    state: RwLock<ServiceState>,
    transition_lock: tokio::sync::Mutex<()>,
    hooks: RwLock<Vec<Arc<dyn LifecycleHook>>>,
}

impl Default for ServiceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRuntime {
    /// Create a machine in `initialized`.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ServiceState::Initialized),
            transition_lock: tokio::sync::Mutex::new(()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Attach a hook; call before driving transitions.
    pub fn add_hook(&self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.write().unwrap_or_else(|e| e.into_inner()).push(hook);
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// True while the HTTP layer should accept execution requests.
    pub fn accepting_requests(&self) -> bool {
        matches!(self.state(), ServiceState::Ready | ServiceState::Running)
    }

    /// Enter `provisioning`.
    pub async fn provisioning(&self, reason: Option<&str>) -> crate::Result<()> {
        self.transition(
            LifecyclePhase::Provisioning,
            ServiceState::Provisioning,
            &[ServiceState::Initialized],
            reason,
        )
        .await
    }

    /// Enter `ready`.
    pub async fn ready(&self, reason: Option<&str>) -> crate::Result<()> {
        self.transition(
            LifecyclePhase::Ready,
            ServiceState::Ready,
            &[ServiceState::Provisioning],
            reason,
        )
        .await
    }

    /// Enter `running`.
    pub async fn running(&self, reason: Option<&str>) -> crate::Result<()> {
        self.transition(
            LifecyclePhase::Running,
            ServiceState::Running,
            &[ServiceState::Ready, ServiceState::Degraded],
            reason,
        )
        .await
    }

    /// Enter `degraded`.
    pub async fn degraded(&self, reason: Option<&str>) -> crate::Result<()> {
        self.transition(
            LifecyclePhase::Degraded,
            ServiceState::Degraded,
            &[ServiceState::Running],
            reason,
        )
        .await
    }

    /// Enter `draining`; attached hooks drain the executor.
    pub async fn draining(&self, reason: Option<&str>) -> crate::Result<()> {
        self.transition(
            LifecyclePhase::Draining,
            ServiceState::Draining,
            &[ServiceState::Running, ServiceState::Degraded],
            reason,
        )
        .await
    }

    /// Enter the terminal `stopped` state.
    pub async fn stop(&self, reason: Option<&str>) -> crate::Result<()> {
        self.transition(
            LifecyclePhase::Stopped,
            ServiceState::Stopped,
            &[
                ServiceState::Initialized,
                ServiceState::Provisioning,
                ServiceState::Ready,
                ServiceState::Running,
                ServiceState::Degraded,
                ServiceState::Draining,
                ServiceState::Failed,
            ],
            reason,
        )
        .await
    }

    async fn transition(
        &self,
        phase: LifecyclePhase,
        to: ServiceState,
        allowed_from: &[ServiceState],
        reason: Option<&str>,
    ) -> crate::Result<()> {
        let _guard = self.transition_lock.lock().await;

        let from = self.state();
        if from == to {
            return Err(LifecycleError::AlreadyInState {
                state: from.as_str(),
            }
            .into());
        }
        if !allowed_from.contains(&from) {
            return Err(LifecycleError::InvalidTransition {
                from: from.as_str(),
                to: to.as_str(),
            }
            .into());
        }

        let ctx = TransitionContext {
            phase,
            from,
            to,
            reason: reason.map(str::to_string),
        };

        let hooks = self.eligible_hooks(phase);
        let mut ran: Vec<Arc<dyn LifecycleHook>> = Vec::with_capacity(hooks.len());
        let mut before_error: Option<String> = None;

        for hook in hooks {
            match hook.before(&ctx).await {
                Ok(()) => ran.push(hook),
                Err(e) => {
                    before_error = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(message) = before_error {
            error!(?phase, %message, "Lifecycle before-hook failed; entering failed state");
            *self.state.write().unwrap_or_else(|e| e.into_inner()) = ServiceState::Failed;
            for hook in ran.iter().rev() {
                if let Err(e) = hook.after(&ctx).await {
                    warn!(?phase, error = %e, "Lifecycle after-hook failed");
                }
            }
            return Err(LifecycleError::HookFailed { phase, message }.into());
        }

        *self.state.write().unwrap_or_else(|e| e.into_inner()) = to;
        info!(from = from.as_str(), to = to.as_str(), "Lifecycle transition");

        for hook in ran.iter().rev() {
            if let Err(e) = hook.after(&ctx).await {
                warn!(?phase, error = %e, "Lifecycle after-hook failed");
            }
        }
        Ok(())
    }

    fn eligible_hooks(&self, phase: LifecyclePhase) -> Vec<Arc<dyn LifecycleHook>> {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
        let mut eligible: Vec<(usize, Arc<dyn LifecycleHook>)> = hooks
            .iter()
            .enumerate()
            .filter(|(_, h)| h.can_handle(phase))
            .map(|(i, h)| (i, Arc::clone(h)))
            .collect();
        // Descending priority, registration order as the tie-breaker.
        eligible.sort_by_key(|(index, hook)| (-hook.priority(), *index));
        eligible.into_iter().map(|(_, hook)| hook).collect()
    }
}
