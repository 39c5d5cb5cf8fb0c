//! Worker-mode entry point
//!
//! Pool workers are the host binary re-entered in worker mode: the pool
//! spawns `current_exe()` with [`WORKER_ENV`] set, and the host's `main`
//! calls [`maybe_run_worker`] with its fully built registry before doing
//! anything else. Both processes construct the registry from the same code,
//! so a task message only needs to carry the `(name, version)` key for the
//! worker to resolve the entrypoint.
//!
//! The loop is deliberately blocking and single-threaded: read a frame off
//! stdin, execute, write the result frame to stdout, repeat. Stdout belongs
//! to the result protocol; anything user code writes to stderr is drained
//! and re-logged by the parent.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};

use chrono::Utc;
use serde_json::Value;

use crate::context;
use crate::execution::pool::messages::{
    read_frame, write_frame, ReadyMessage, TaskMessage, TaskResultMessage, WorkerReply,
    WorkerRequest,
};
use crate::execution::{ErrorKind, ExecutionError};
use crate::registry::AlgorithmRegistry;
use crate::spec::{initialize_guarded, run_guarded, ErasedAlgorithm, RunFailure};

/// Environment marker the pool sets on spawned workers.
pub const WORKER_ENV: &str = "ALGOSERVE_WORKER";

/// Label of the pool that owns this worker, for diagnostics.
pub const WORKER_POOL_ENV: &str = "ALGOSERVE_WORKER_POOL";

/// True when this process was spawned as a pool worker.
pub fn is_worker_process() -> bool {
    std::env::var(WORKER_ENV).is_ok_and(|v| v == "1")
}

/// Run the worker loop if this process is in worker mode.
///
/// Hosts call this first thing in `main` with their assembled registry;
/// `true` means the loop ran to completion and the process should exit.
pub fn maybe_run_worker(registry: &AlgorithmRegistry) -> bool {
    if !is_worker_process() {
        return false;
    }
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(stdout.lock());
    if let Err(e) = run_worker_loop(registry, &mut reader, &mut writer) {
        eprintln!("worker loop terminated: {e}");
    }
    true
}

fn run_worker_loop<R: Read, W: Write>(
    registry: &AlgorithmRegistry,
    reader: &mut R,
    writer: &mut W,
) -> std::io::Result<()> {
    write_frame(
        writer,
        &WorkerReply::Ready(ReadyMessage {
            pid: std::process::id(),
        }),
    )?;

    // Stateful instances, one per entrypoint ref, alive until this process
    // is stopped or killed.
    let mut instances: HashMap<String, Box<dyn ErasedAlgorithm>> = HashMap::new();

    loop {
        match read_frame::<WorkerRequest, _>(reader)? {
            Some(WorkerRequest::Task(task)) => {
                let result = execute_task(registry, &mut instances, task);
                write_frame(writer, &WorkerReply::Result(result))?;
            }
            Some(WorkerRequest::Stop) | None => break,
        }
    }

    for (_, mut algorithm) in instances.drain() {
        algorithm.shutdown();
    }
    Ok(())
}

fn execute_task(
    registry: &AlgorithmRegistry,
    instances: &mut HashMap<String, Box<dyn ErasedAlgorithm>>,
    task: TaskMessage,
) -> TaskResultMessage {
    let started_at = Utc::now();
    let pid = std::process::id();
    let task_id = task.task_id;

    let _guard = context::install(
        Some(task.request_id.clone()),
        task.trace_id.clone(),
        task.context.clone(),
        Some(task.request_datetime),
    );

    let outcome = run_task(registry, instances, &task);
    // Captured on every exit path, including user errors.
    let response_meta = context::take_response_meta();

    let ended_at = Utc::now();
    match outcome {
        Ok(data) => TaskResultMessage {
            task_id,
            success: true,
            data: Some(data),
            error: None,
            response_meta,
            started_at,
            ended_at,
            pid,
        },
        Err(failure) => TaskResultMessage {
            task_id,
            success: false,
            data: None,
            error: Some(failure_to_error(failure)),
            response_meta,
            started_at,
            ended_at,
            pid,
        },
    }
}

fn run_task(
    registry: &AlgorithmRegistry,
    instances: &mut HashMap<String, Box<dyn ErasedAlgorithm>>,
    task: &TaskMessage,
) -> Result<Value, RunFailure> {
    let spec = registry.get(&task.name, &task.version).map_err(|_| {
        RunFailure::System(format!(
            "entrypoint {}@{} is not registered in the worker process",
            task.name, task.version
        ))
    })?;

    if task.stateful {
        let algorithm = match instances.entry(spec.ref_key()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let mut algorithm = spec.entrypoint.instantiate();
                initialize_guarded(&mut algorithm)?;
                vacant.insert(algorithm)
            }
        };
        let result = run_guarded(algorithm, &task.payload, task.hyperparams.as_ref());
        if result.is_ok() {
            algorithm.after_run();
        }
        result
    } else {
        let mut algorithm = spec.entrypoint.instantiate();
        initialize_guarded(&mut algorithm)?;
        let result = run_guarded(&mut algorithm, &task.payload, task.hyperparams.as_ref());
        if result.is_ok() {
            algorithm.after_run();
        }
        algorithm.shutdown();
        result
    }
}

fn failure_to_error(failure: RunFailure) -> ExecutionError {
    match failure {
        RunFailure::Validation(message) => ExecutionError::new(ErrorKind::Validation, message),
        RunFailure::Runtime(message) => ExecutionError::new(ErrorKind::Runtime, message),
        RunFailure::System(message) => ExecutionError::new(ErrorKind::System, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Algorithm, AlgorithmSpec, NoParams};
    use schemars::JsonSchema;
    use serde_json::json;

    #[derive(serde::Serialize, serde::Deserialize, JsonSchema)]
    struct In {
        value: i64,
    }

    #[derive(serde::Serialize, JsonSchema)]
    struct Out {
        doubled: i64,
        seen_request: Option<String>,
    }

    #[derive(Default)]
    struct Doubler;

    impl Algorithm for Doubler {
        type Input = In;
        type Output = Out;
        type Params = NoParams;

        fn run(&mut self, req: In, _params: Option<NoParams>) -> crate::Result<Out> {
            Ok(Out {
                doubled: req.value * 2,
                seen_request: context::current_request_id(),
            })
        }
    }

    fn registry() -> AlgorithmRegistry {
        let registry = AlgorithmRegistry::new();
        registry
            .register(
                AlgorithmSpec::builder("double", "v1")
                    .created_time("2026-01-01")
                    .author("qa")
                    .category("unit")
                    .class::<Doubler>()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn task(payload: Value) -> TaskMessage {
        TaskMessage {
            task_id: 1,
            name: "double".into(),
            version: "v1".into(),
            payload,
            hyperparams: None,
            request_id: "r1".into(),
            trace_id: None,
            context: None,
            request_datetime: Utc::now(),
            stateful: false,
        }
    }

    #[test]
    fn worker_loop_handshakes_executes_and_stops() {
        let registry = registry();

        let mut input = Vec::new();
        write_frame(&mut input, &WorkerRequest::Task(task(json!({"value": 21})))).unwrap();
        write_frame(&mut input, &WorkerRequest::Stop).unwrap();

        let mut reader = std::io::Cursor::new(input);
        let mut output = Vec::new();
        run_worker_loop(&registry, &mut reader, &mut output).unwrap();

        let mut frames = std::io::Cursor::new(output);
        assert!(matches!(
            read_frame::<WorkerReply, _>(&mut frames).unwrap(),
            Some(WorkerReply::Ready(_))
        ));
        match read_frame::<WorkerReply, _>(&mut frames).unwrap() {
            Some(WorkerReply::Result(result)) => {
                assert!(result.success);
                let data = result.data.unwrap();
                assert_eq!(data["doubled"], json!(42));
                // Context store was installed for the duration of the task.
                assert_eq!(data["seen_request"], json!("r1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_entrypoint_is_a_system_error() {
        let registry = AlgorithmRegistry::new();
        let mut instances = HashMap::new();
        let result = execute_task(&registry, &mut instances, task(json!({"value": 1})));
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, ErrorKind::System);
    }

    #[test]
    fn bad_payload_is_a_validation_error() {
        let registry = registry();
        let mut instances = HashMap::new();
        let result = execute_task(&registry, &mut instances, task(json!({"value": "x"})));
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
    }
}
