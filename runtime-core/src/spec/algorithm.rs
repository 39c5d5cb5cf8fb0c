//! Algorithm entrypoint traits and their type-erased adapters
//!
//! Authors implement [`Algorithm`] (class-style, with lifecycle hooks) or
//! register a plain function. The builder erases both behind
//! [`Entrypoint`], which carries a factory the worker loop can instantiate on
//! its side of the process boundary. Payloads cross that boundary as JSON;
//! typed decode/encode happens inside the adapter so a schema mismatch
//! surfaces as a `validation` failure instead of a transport error.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// Marker trait for hyperparameter models.
///
/// Declared params get a schema in the registry and are decoded from the
/// execution request before `run`; [`NoParams`] opts out.
pub trait HyperParams: DeserializeOwned + JsonSchema + Send + 'static {
    /// Whether the implementing model is a real declaration.
    const DECLARED: bool = true;
}

/// Placeholder params type for algorithms without hyperparameters.
#[derive(Debug, Clone, Copy, serde::Deserialize, JsonSchema)]
pub struct NoParams;

impl HyperParams for NoParams {
    const DECLARED: bool = false;
}

/// Class-style algorithm with lifecycle hooks.
///
/// `initialize` runs once per instance before the first request,
/// `after_run` after each successful `run`, and `shutdown` when the instance
/// is discarded. Instances live inside worker processes; with
/// `stateful = true` one instance per worker is cached across requests and
/// is lost when the supervisor kills that worker.
///
/// Worker stdout carries the result protocol; algorithm code must not write
/// to stdout (stderr is fine and is forwarded to the server log).
pub trait Algorithm: Send + 'static {
    /// Input model, decoded from the request `data` payload.
    type Input: DeserializeOwned + Serialize + JsonSchema + Send;
    /// Output model, serialized into the response `data` payload.
    type Output: Serialize + JsonSchema + Send;
    /// Hyperparameter model; use [`NoParams`] when there is none.
    type Params: HyperParams;

    /// One-time setup before the first request.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Execute one unit of work.
    fn run(&mut self, req: Self::Input, params: Option<Self::Params>) -> Result<Self::Output>;

    /// Post-processing after each successful `run`.
    fn after_run(&mut self) {}

    /// Release resources; must be safe to call more than once.
    fn shutdown(&mut self) {}
}

/// Failure modes of one erased invocation, mapped to the error taxonomy by
/// the executor.
#[derive(Debug)]
pub(crate) enum RunFailure {
    /// Payload or params failed typed decode
    Validation(String),
    /// User code returned an error or panicked
    Runtime(String),
    /// Output failed to serialize
    System(String),
}

/// Object-safe algorithm instance as seen by executors and workers.
pub(crate) trait ErasedAlgorithm: Send {
    fn initialize(&mut self) -> std::result::Result<(), RunFailure>;
    fn run(
        &mut self,
        payload: &Value,
        params: Option<&Value>,
    ) -> std::result::Result<Value, RunFailure>;
    fn after_run(&mut self);
    fn shutdown(&mut self);
}

/// Factory producing fresh erased instances; shared by inline executors and
/// worker processes.
pub(crate) trait EntrypointFactory: Send + Sync {
    fn instantiate(&self) -> Box<dyn ErasedAlgorithm>;
}

/// Entrypoint variant recorded in the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrypointKind {
    /// Stateless function entrypoint
    Function,
    /// Class entrypoint with lifecycle hooks
    Class,
}

/// Type-erased algorithm entrypoint carried by [`crate::spec::AlgorithmSpec`].
#[derive(Clone)]
pub struct Entrypoint {
    kind: EntrypointKind,
    factory: Arc<dyn EntrypointFactory>,
}

impl Entrypoint {
    pub(crate) fn from_class<A, F>(factory: F) -> Self
    where
        A: Algorithm,
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self {
            kind: EntrypointKind::Class,
            factory: Arc::new(ClassFactory {
                build: factory,
                _algo: std::marker::PhantomData::<fn() -> A>,
            }),
        }
    }

    pub(crate) fn from_function<I, O, F>(f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Result<O> + Send + Sync + 'static,
    {
        Self {
            kind: EntrypointKind::Function,
            factory: Arc::new(FunctionFactory {
                f: Arc::new(f),
                _io: std::marker::PhantomData::<fn(I) -> O>,
            }),
        }
    }

    /// Whether this entrypoint is class-based.
    pub fn is_class(&self) -> bool {
        self.kind == EntrypointKind::Class
    }

    /// The entrypoint variant.
    pub fn kind(&self) -> EntrypointKind {
        self.kind
    }

    pub(crate) fn instantiate(&self) -> Box<dyn ErasedAlgorithm> {
        self.factory.instantiate()
    }
}

impl fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entrypoint").field("kind", &self.kind).finish()
    }
}

/// Run `initialize` with panic containment.
pub(crate) fn initialize_guarded(
    algo: &mut Box<dyn ErasedAlgorithm>,
) -> std::result::Result<(), RunFailure> {
    match catch_unwind(AssertUnwindSafe(|| algo.initialize())) {
        Ok(result) => result,
        Err(payload) => Err(RunFailure::Runtime(format!(
            "initialize panicked: {}",
            panic_message(&payload)
        ))),
    }
}

/// Run `run` with panic containment so a panicking algorithm does not take
/// its worker down.
pub(crate) fn run_guarded(
    algo: &mut Box<dyn ErasedAlgorithm>,
    payload: &Value,
    params: Option<&Value>,
) -> std::result::Result<Value, RunFailure> {
    match catch_unwind(AssertUnwindSafe(|| algo.run(payload, params))) {
        Ok(result) => result,
        Err(payload) => Err(RunFailure::Runtime(format!(
            "algorithm panicked: {}",
            panic_message(&payload)
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct ClassFactory<A, F> {
    build: F,
    _algo: std::marker::PhantomData<fn() -> A>,
}

impl<A, F> EntrypointFactory for ClassFactory<A, F>
where
    A: Algorithm,
    F: Fn() -> A + Send + Sync + 'static,
{
    fn instantiate(&self) -> Box<dyn ErasedAlgorithm> {
        Box::new(ClassAdapter {
            inner: (self.build)(),
        })
    }
}

struct ClassAdapter<A: Algorithm> {
    inner: A,
}

impl<A: Algorithm> ErasedAlgorithm for ClassAdapter<A> {
    fn initialize(&mut self) -> std::result::Result<(), RunFailure> {
        self.inner
            .initialize()
            .map_err(|e| RunFailure::Runtime(e.to_string()))
    }

    fn run(
        &mut self,
        payload: &Value,
        params: Option<&Value>,
    ) -> std::result::Result<Value, RunFailure> {
        let input: A::Input = serde_json::from_value(payload.clone())
            .map_err(|e| RunFailure::Validation(format!("input does not match schema: {e}")))?;

        let decoded_params: Option<A::Params> = match params {
            Some(raw) if A::Params::DECLARED => Some(
                serde_json::from_value(raw.clone()).map_err(|e| {
                    RunFailure::Validation(format!("hyperparams do not match schema: {e}"))
                })?,
            ),
            _ => None,
        };

        let output = self
            .inner
            .run(input, decoded_params)
            .map_err(|e| RunFailure::Runtime(e.to_string()))?;

        serde_json::to_value(output)
            .map_err(|e| RunFailure::System(format!("output serialization failed: {e}")))
    }

    fn after_run(&mut self) {
        self.inner.after_run();
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }
}

struct FunctionFactory<I, O, F> {
    f: Arc<F>,
    _io: std::marker::PhantomData<fn(I) -> O>,
}

impl<I, O, F> EntrypointFactory for FunctionFactory<I, O, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I) -> Result<O> + Send + Sync + 'static,
{
    fn instantiate(&self) -> Box<dyn ErasedAlgorithm> {
        Box::new(FunctionAdapter {
            f: Arc::clone(&self.f),
            _io: std::marker::PhantomData::<fn(I) -> O>,
        })
    }
}

struct FunctionAdapter<I, O, F> {
    f: Arc<F>,
    _io: std::marker::PhantomData<fn(I) -> O>,
}

impl<I, O, F> ErasedAlgorithm for FunctionAdapter<I, O, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I) -> Result<O> + Send + Sync + 'static,
{
    fn initialize(&mut self) -> std::result::Result<(), RunFailure> {
        Ok(())
    }

    fn run(
        &mut self,
        payload: &Value,
        _params: Option<&Value>,
    ) -> std::result::Result<Value, RunFailure> {
        let input: I = serde_json::from_value(payload.clone())
            .map_err(|e| RunFailure::Validation(format!("input does not match schema: {e}")))?;
        let output = (self.f)(input).map_err(|e| RunFailure::Runtime(e.to_string()))?;
        serde_json::to_value(output)
            .map_err(|e| RunFailure::System(format!("output serialization failed: {e}")))
    }

    fn after_run(&mut self) {}

    fn shutdown(&mut self) {}
}
