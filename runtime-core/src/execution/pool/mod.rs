//! Supervised worker pool
//!
//! A fixed-size set of long-lived OS-process workers fed from a bounded
//! admission queue. Three concurrent activities run in the parent:
//!
//! - a dispatcher pairing admitted tasks with idle workers,
//! - one result reader per worker draining its stdout pipe,
//! - a supervisor sleeping until the nearest deadline, killing and replacing
//!   workers that overrun it (and observing crashes via pipe EOF).
//!
//! Every admitted task resolves to exactly one [`ExecutionResult`]. The
//! pending-task map is the arbiter: whichever activity removes a task's entry
//! owns publishing its result, so timeout, crash, and normal completion are
//! mutually exclusive per task. Killing the OS process is the only reliable
//! way to reclaim CPU and memory from runaway user code; the admission
//! semaphore turns overload into a first-class `rejected` outcome instead of
//! unbounded queue growth.

pub(crate) mod messages;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::execution::{ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult};
use crate::observability::ServiceMetrics;
use crate::settings::RuntimeSettings;
use crate::worker::{WORKER_ENV, WORKER_POOL_ENV};
use messages::{TaskMessage, TaskResultMessage, WorkerReply, WorkerRequest};

/// Static configuration for one pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name used in logs and metrics (`shared`, or `name@version`)
    pub label: String,
    /// Number of worker processes
    pub max_workers: usize,
    /// Admission capacity; submits beyond it wait then reject
    pub queue_size: usize,
    /// How long a submit may wait for admission
    pub admit_timeout: Duration,
    /// Fallback effective timeout when neither request nor spec set one
    pub default_timeout: Option<Duration>,
    /// Grace between SIGTERM and SIGKILL for pool-level operations
    pub kill_grace: Duration,
    /// Kill whole process groups regardless of per-spec settings
    pub kill_tree: bool,
    /// How long a spawned worker may take to send its Ready frame
    pub spawn_timeout: Duration,
}

impl PoolConfig {
    /// Config for the shared pool from runtime settings.
    pub fn shared(settings: &RuntimeSettings) -> Self {
        Self {
            label: "shared".to_string(),
            max_workers: settings.global_max_workers,
            queue_size: settings.global_queue_size,
            admit_timeout: settings.admit_timeout,
            default_timeout: settings.default_timeout,
            kill_grace: settings.kill_grace,
            kill_tree: settings.kill_tree,
            spawn_timeout: settings.spawn_timeout,
        }
    }

    /// Config for a per-algorithm isolated pool.
    pub fn isolated(label: impl Into<String>, max_workers: usize, settings: &RuntimeSettings) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            label: label.into(),
            max_workers,
            queue_size: max_workers,
            admit_timeout: settings.admit_timeout,
            default_timeout: settings.default_timeout,
            kill_grace: settings.kill_grace,
            kill_tree: settings.kill_tree,
            spawn_timeout: settings.spawn_timeout,
        }
    }
}

struct PendingTask {
    message: TaskMessage,
    deadline: Option<Instant>,
    kill_grace: Duration,
    kill_tree: bool,
    reply: oneshot::Sender<ExecutionResult>,
    admitted_at: Instant,
    assigned: Option<usize>,
    dispatched_at: Option<Instant>,
    dispatched_wall: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum SlotState {
    Idle,
    Busy(BusyTask),
    /// Deadline kill issued; waiting for the process to exit
    Killing,
    Dead,
}

#[derive(Debug, Clone)]
struct BusyTask {
    task_id: u64,
    deadline: Option<Instant>,
    kill_grace: Duration,
    kill_tree: bool,
}

struct WorkerSlot {
    generation: u64,
    pid: u32,
    stdin: Option<ChildStdin>,
    child: Option<Child>,
    state: SlotState,
}

impl WorkerSlot {
    fn vacant() -> Self {
        Self {
            generation: 0,
            pid: 0,
            stdin: None,
            child: None,
            state: SlotState::Dead,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IdleToken {
    slot: usize,
    generation: u64,
}

struct PoolShared {
    label: String,
    admit: Semaphore,
    tasks: StdMutex<HashMap<u64, PendingTask>>,
    slots: StdMutex<Vec<WorkerSlot>>,
    idle_tx: mpsc::UnboundedSender<IdleToken>,
    dispatch_tx: StdMutex<Option<mpsc::UnboundedSender<u64>>>,
    deadline_notify: Notify,
    shutdown_notify: Notify,
    stopping: AtomicBool,
    next_task_id: AtomicU64,
    spawn_timeout: Duration,
    metrics: Option<Arc<ServiceMetrics>>,
}

impl PoolShared {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<WorkerSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a terminal result and return the admission permit.
    fn publish(&self, entry: PendingTask, result: ExecutionResult) {
        let _ = entry.reply.send(result);
        self.admit.add_permits(1);
    }
}

/// Process-pool executor backed by supervised OS-process workers.
pub struct ProcessPoolExecutor {
    config: PoolConfig,
    shared: Arc<PoolShared>,
    started: AtomicBool,
    dispatch_rx: StdMutex<Option<mpsc::UnboundedReceiver<u64>>>,
    idle_rx: StdMutex<Option<mpsc::UnboundedReceiver<IdleToken>>>,
}

impl ProcessPoolExecutor {
    /// Create a pool; workers spawn on [`start`](Self::start).
    pub fn new(config: PoolConfig, metrics: Option<Arc<ServiceMetrics>>) -> Self {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let mut slots = Vec::with_capacity(config.max_workers);
        slots.resize_with(config.max_workers, WorkerSlot::vacant);

        let shared = Arc::new(PoolShared {
            label: config.label.clone(),
            admit: Semaphore::new(config.queue_size),
            tasks: StdMutex::new(HashMap::new()),
            slots: StdMutex::new(slots),
            idle_tx,
            dispatch_tx: StdMutex::new(Some(dispatch_tx)),
            deadline_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            stopping: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
            spawn_timeout: config.spawn_timeout,
            metrics,
        });

        Self {
            config,
            shared,
            started: AtomicBool::new(false),
            dispatch_rx: StdMutex::new(Some(dispatch_rx)),
            idle_rx: StdMutex::new(Some(idle_rx)),
        }
    }

    /// Spawn the workers and the pool's dispatcher/supervisor activities.
    ///
    /// Failing to spawn the initial complement is fatal: the pool cannot
    /// provide its capacity invariant without them.
    pub async fn start(&self) -> crate::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(pool = %self.config.label, workers = self.config.max_workers, "Starting worker pool");

        for slot_idx in 0..self.config.max_workers {
            spawn_into_slot(&self.shared, slot_idx).await.map_err(|e| {
                crate::Error::Execution(format!(
                    "failed to spawn initial worker {slot_idx} for pool {}: {e}",
                    self.config.label
                ))
            })?;
        }

        let dispatch_rx = self
            .dispatch_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let idle_rx = self.idle_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let (Some(dispatch_rx), Some(idle_rx)) = (dispatch_rx, idle_rx) {
            tokio::spawn(run_dispatcher(Arc::clone(&self.shared), dispatch_rx, idle_rx));
        }
        tokio::spawn(run_supervisor(Arc::clone(&self.shared)));

        Ok(())
    }

    /// Whether [`start`](Self::start) completed.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shared.is_stopping()
    }

    /// Close admission and stop the workers.
    ///
    /// With `wait = true`, in-flight tasks run to their natural end (their
    /// deadlines still apply) before workers receive the stop sentinel. With
    /// `wait = false`, queued tasks are rejected, busy workers are killed
    /// after the pool kill grace, and their tasks resolve as `system` errors.
    pub async fn shutdown(&self, wait: bool) -> crate::Result<()> {
        if !self.started.load(Ordering::SeqCst) || self.shared.is_stopping() {
            return Ok(());
        }

        info!(pool = %self.config.label, wait, "Shutting down worker pool");
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.admit.close();
        // Closing the dispatch channel ends the dispatcher once it drains.
        self.shared
            .dispatch_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        // notify_one stores a permit, so these wake the dispatcher and the
        // supervisor even if they have not reached their wait points yet.
        self.shared.shutdown_notify.notify_one();
        self.shared.deadline_notify.notify_one();

        if wait {
            while !self.shared.lock_tasks().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        } else {
            // Queued tasks never started; reject them now so every admitted
            // submit still gets its one result.
            let drained: Vec<PendingTask> = {
                let mut tasks = self.shared.lock_tasks();
                let ids: Vec<u64> = tasks
                    .iter()
                    .filter(|(_, t)| t.assigned.is_none())
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter().filter_map(|id| tasks.remove(&id)).collect()
            };
            for entry in drained {
                self.shared.publish(
                    entry,
                    ExecutionResult::rejected("executor is shut down; task was never started"),
                );
            }
        }

        // Stop sentinel to every live worker; dropping stdin doubles as EOF.
        for slot_idx in 0..self.config.max_workers {
            let stdin = {
                let mut slots = self.shared.lock_slots();
                slots[slot_idx].stdin.take()
            };
            if let Some(mut stdin) = stdin {
                let _ = messages::write_frame_async(&mut stdin, &WorkerRequest::Stop).await;
            }
        }

        // Give workers the grace period, then force-kill stragglers.
        let deadline = Instant::now() + self.config.kill_grace;
        loop {
            let all_dead = self
                .shared
                .lock_slots()
                .iter()
                .all(|s| matches!(s.state, SlotState::Dead));
            if all_dead {
                break;
            }
            if Instant::now() >= deadline {
                let stragglers: Vec<(u32, bool)> = self
                    .shared
                    .lock_slots()
                    .iter()
                    .filter(|s| !matches!(s.state, SlotState::Dead))
                    .map(|s| (s.pid, self.config.kill_tree))
                    .collect();
                for (pid, tree) in stragglers {
                    warn!(pool = %self.shared.label, pid, "Worker did not stop in time, force killing");
                    signal_worker(pid, tree, KillSignal::Force);
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Ok(())
    }

    /// Submit one request and wait for its terminal result.
    pub async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        if !self.started.load(Ordering::SeqCst) {
            return ExecutionResult::rejected("executor is not started");
        }
        if self.shared.is_stopping() {
            return ExecutionResult::rejected("executor is shut down");
        }

        // Bounded admission: wait up to admit_timeout for capacity.
        let permit = match tokio::time::timeout(
            self.config.admit_timeout,
            self.shared.admit.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return ExecutionResult::rejected("executor is shut down");
            }
            Err(_elapsed) => {
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_rejection(&self.shared.label);
                }
                return ExecutionResult::rejected(format!(
                    "admission queue full: no capacity within {:?}",
                    self.config.admit_timeout
                ));
            }
        };
        // The permit is returned manually when the task's result publishes.
        permit.forget();

        let task_id = self.shared.next_task_id.fetch_add(1, Ordering::SeqCst);
        let deadline = request
            .effective_timeout(self.config.default_timeout)
            .map(|t| Instant::now() + t);

        let message = TaskMessage {
            task_id,
            name: request.spec.name.clone(),
            version: request.spec.version.clone(),
            payload: request.payload.clone(),
            hyperparams: request.hyperparams.clone(),
            request_id: request.request_id.clone(),
            trace_id: request.trace_id.clone(),
            context: request.context.clone(),
            request_datetime: request.request_datetime,
            stateful: request.spec.execution.stateful,
        };

        let (reply_tx, mut reply_rx) = oneshot::channel();
        {
            let mut tasks = self.shared.lock_tasks();
            tasks.insert(
                task_id,
                PendingTask {
                    message,
                    deadline,
                    kill_grace: request.spec.execution.kill_grace(),
                    kill_tree: request.spec.execution.kill_tree || self.config.kill_tree,
                    reply: reply_tx,
                    admitted_at: Instant::now(),
                    assigned: None,
                    dispatched_at: None,
                    dispatched_wall: None,
                },
            );
        }

        let sent = {
            let dispatch_tx = self
                .shared
                .dispatch_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            dispatch_tx
                .as_ref()
                .map(|tx| tx.send(task_id).is_ok())
                .unwrap_or(false)
        };
        if !sent {
            if let Some(entry) = self.shared.lock_tasks().remove(&task_id) {
                drop(entry.reply);
                self.shared.admit.add_permits(1);
            }
            return ExecutionResult::rejected("executor is shut down");
        }

        // Wait for the terminal event; if the deadline passes while the task
        // is still queued, cancel it in place without touching any worker.
        let outcome = match deadline {
            None => reply_rx.await,
            Some(deadline) => {
                tokio::select! {
                    result = &mut reply_rx => result,
                    _ = tokio::time::sleep_until(deadline) => {
                        let queued = {
                            let mut tasks = self.shared.lock_tasks();
                            match tasks.get(&task_id) {
                                Some(entry) if entry.assigned.is_none() => tasks.remove(&task_id),
                                _ => None,
                            }
                        };
                        if let Some(entry) = queued {
                            let result = queued_timeout_result(&entry);
                            drop(entry.reply);
                            self.shared.admit.add_permits(1);
                            return result;
                        }
                        // Already on a worker; the supervisor owns the kill.
                        reply_rx.await
                    }
                }
            }
        };

        outcome.unwrap_or_else(|_| {
            ExecutionResult::fail(ExecutionError::new(
                ErrorKind::System,
                "result channel closed before a terminal event",
            ))
        })
    }
}

fn queued_timeout_result(entry: &PendingTask) -> ExecutionResult {
    let mut result = ExecutionResult::fail(ExecutionError::new(
        ErrorKind::Timeout,
        "hard timeout before execution started",
    ));
    result.ended_at = Some(Utc::now());
    result.queue_wait_ms = Some(entry.admitted_at.elapsed().as_secs_f64() * 1000.0);
    result
}

// ---------------------------------------------------------------------------
// Worker spawning
// ---------------------------------------------------------------------------

async fn spawn_into_slot(shared: &Arc<PoolShared>, slot_idx: usize) -> std::io::Result<()> {
    let program = std::env::current_exe()?;

    let mut command = Command::new(program);
    command
        .env(WORKER_ENV, "1")
        .env(WORKER_POOL_ENV, &shared.label)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    // Own process group so kill_tree can reach grandchildren.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.as_std_mut().process_group(0);
    }

    let mut child = command.spawn()?;
    let pid = child.id().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "spawned worker has no pid")
    })?;

    let stdin = child.stdin.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "worker stdin not captured")
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "worker stdout not captured")
    })?;
    if let Some(stderr) = child.stderr.take() {
        let label = shared.label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(pool = %label, worker = pid, "{line}");
            }
        });
    }

    // Readiness handshake: the worker announces itself before claiming work.
    let mut reader = BufReader::new(stdout);
    let ready = tokio::time::timeout(
        shared.spawn_timeout,
        messages::read_frame_async::<WorkerReply, _>(&mut reader),
    )
    .await;
    match ready {
        Ok(Ok(Some(WorkerReply::Ready(_)))) => {}
        Ok(Ok(other)) => {
            let _ = child.start_kill();
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("worker {pid} sent unexpected first frame: {other:?}"),
            ));
        }
        Ok(Err(e)) => {
            let _ = child.start_kill();
            return Err(e);
        }
        Err(_elapsed) => {
            let _ = child.start_kill();
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("worker {pid} did not become ready in time"),
            ));
        }
    }

    let generation = {
        let mut slots = shared.lock_slots();
        let slot = &mut slots[slot_idx];
        slot.generation += 1;
        slot.pid = pid;
        slot.stdin = Some(stdin);
        slot.child = Some(child);
        slot.state = SlotState::Idle;
        slot.generation
    };

    info!(pool = %shared.label, slot = slot_idx, pid, "Worker ready");
    let _ = shared.idle_tx.send(IdleToken {
        slot: slot_idx,
        generation,
    });

    tokio::spawn(run_reader(Arc::clone(shared), slot_idx, generation, reader));
    Ok(())
}

fn respawn_with_retry(shared: Arc<PoolShared>, slot_idx: usize) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            if shared.is_stopping() {
                return;
            }
            match spawn_into_slot(&shared, slot_idx).await {
                Ok(()) => return,
                Err(e) => {
                    error!(pool = %shared.label, slot = slot_idx, error = %e,
                           "Failed to respawn worker, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn run_dispatcher(
    shared: Arc<PoolShared>,
    mut dispatch_rx: mpsc::UnboundedReceiver<u64>,
    mut idle_rx: mpsc::UnboundedReceiver<IdleToken>,
) {
    while let Some(task_id) = dispatch_rx.recv().await {
        // Skip tasks that were cancelled while queued.
        if !shared.lock_tasks().contains_key(&task_id) {
            continue;
        }

        // Claim an idle worker, discarding tokens from replaced generations.
        let token = loop {
            let token = tokio::select! {
                token = idle_rx.recv() => match token {
                    Some(token) => token,
                    None => return,
                },
                _ = shared.shutdown_notify.notified() => {
                    if shared.is_stopping() {
                        return;
                    }
                    continue;
                }
            };
            let slots = shared.lock_slots();
            let slot = &slots[token.slot];
            if slot.generation == token.generation && matches!(slot.state, SlotState::Idle) {
                break token;
            }
            debug!(pool = %shared.label, slot = token.slot, "Discarding stale idle token");
        };

        // Re-check the task now that a worker is available.
        enum Dispatch {
            Cancelled,
            Expired(PendingTask),
            Go(TaskMessage, BusyTask, f64),
        }
        let decision = {
            let mut tasks = shared.lock_tasks();
            let now = Instant::now();
            let expired =
                matches!(tasks.get(&task_id), Some(e) if e.deadline.is_some_and(|d| now >= d));
            if expired {
                match tasks.remove(&task_id) {
                    Some(entry) => Dispatch::Expired(entry),
                    None => Dispatch::Cancelled,
                }
            } else if let Some(entry) = tasks.get_mut(&task_id) {
                entry.assigned = Some(token.slot);
                entry.dispatched_at = Some(now);
                entry.dispatched_wall = Some(Utc::now());
                let queue_wait = entry.admitted_at.elapsed().as_secs_f64();
                Dispatch::Go(
                    entry.message.clone(),
                    BusyTask {
                        task_id,
                        deadline: entry.deadline,
                        kill_grace: entry.kill_grace,
                        kill_tree: entry.kill_tree,
                    },
                    queue_wait,
                )
            } else {
                Dispatch::Cancelled
            }
        };

        match decision {
            Dispatch::Cancelled => {
                let _ = shared.idle_tx.send(token);
            }
            Dispatch::Expired(entry) => {
                let result = queued_timeout_result(&entry);
                shared.publish(entry, result);
                let _ = shared.idle_tx.send(token);
            }
            Dispatch::Go(message, busy, queue_wait) => {
                if let Some(metrics) = &shared.metrics {
                    metrics.record_queue_wait(&shared.label, queue_wait);
                }
                dispatch_to_worker(&shared, token, message, busy).await;
            }
        }
    }
}

async fn dispatch_to_worker(
    shared: &Arc<PoolShared>,
    token: IdleToken,
    message: TaskMessage,
    busy: BusyTask,
) {
    let task_id = busy.task_id;
    let stdin = {
        let mut slots = shared.lock_slots();
        let slot = &mut slots[token.slot];
        // The worker may have died between the idle claim and now; if so,
        // put the task back in line instead of writing to a dead pipe.
        if slot.generation != token.generation || !matches!(slot.state, SlotState::Idle) {
            None
        } else {
            slot.state = SlotState::Busy(busy);
            slot.stdin.take()
        }
    };

    let Some(mut stdin) = stdin else {
        requeue_task(shared, task_id);
        return;
    };
    // Permit-storing wake: the supervisor picks up the new deadline even if
    // it is mid-scan rather than parked.
    shared.deadline_notify.notify_one();

    match messages::write_frame_async(&mut stdin, &WorkerRequest::Task(message)).await {
        Ok(()) => {
            let mut slots = shared.lock_slots();
            let slot = &mut slots[token.slot];
            if slot.generation == token.generation {
                slot.stdin = Some(stdin);
            }
        }
        Err(e) => {
            fail_dispatch(shared, token, task_id, &format!("failed to write task: {e}")).await;
        }
    }
}

/// Return a claimed-but-undispatched task to the queue.
fn requeue_task(shared: &Arc<PoolShared>, task_id: u64) {
    {
        let mut tasks = shared.lock_tasks();
        if let Some(entry) = tasks.get_mut(&task_id) {
            entry.assigned = None;
            entry.dispatched_at = None;
            entry.dispatched_wall = None;
        } else {
            return;
        }
    }
    let sent = {
        let dispatch_tx = shared
            .dispatch_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        dispatch_tx
            .as_ref()
            .map(|tx| tx.send(task_id).is_ok())
            .unwrap_or(false)
    };
    if !sent {
        // Shutdown closed the queue underneath us; resolve the task now.
        if let Some(entry) = shared.lock_tasks().remove(&task_id) {
            shared.publish(entry, ExecutionResult::rejected("executor is shut down"));
        }
    }
}

async fn fail_dispatch(shared: &Arc<PoolShared>, token: IdleToken, task_id: u64, reason: &str) {
    error!(pool = %shared.label, slot = token.slot, %reason, "Dispatch failed");
    if let Some(entry) = shared.lock_tasks().remove(&task_id) {
        let mut result = ExecutionResult::fail(ExecutionError::new(
            ErrorKind::System,
            format!("dispatch to worker failed: {reason}"),
        ));
        result.ended_at = Some(Utc::now());
        shared.publish(entry, result);
    }
    // Force the broken worker down; its reader observes EOF and respawns.
    let pid = {
        let slots = shared.lock_slots();
        let slot = &slots[token.slot];
        (slot.generation == token.generation).then_some(slot.pid)
    };
    if let Some(pid) = pid {
        signal_worker(pid, false, KillSignal::Force);
    }
}

// ---------------------------------------------------------------------------
// Result reader (one per worker generation)
// ---------------------------------------------------------------------------

async fn run_reader(
    shared: Arc<PoolShared>,
    slot_idx: usize,
    generation: u64,
    mut reader: BufReader<ChildStdout>,
) {
    loop {
        match messages::read_frame_async::<WorkerReply, _>(&mut reader).await {
            Ok(Some(WorkerReply::Result(result))) => {
                deliver_result(&shared, slot_idx, generation, result);
            }
            Ok(Some(WorkerReply::Ready(msg))) => {
                debug!(pool = %shared.label, pid = msg.pid, "Ignoring duplicate ready frame");
            }
            Ok(None) => {
                handle_worker_exit(&shared, slot_idx, generation).await;
                return;
            }
            Err(e) => {
                warn!(pool = %shared.label, slot = slot_idx, error = %e,
                      "Worker pipe read failed");
                handle_worker_exit(&shared, slot_idx, generation).await;
                return;
            }
        }
    }
}

fn deliver_result(
    shared: &Arc<PoolShared>,
    slot_idx: usize,
    generation: u64,
    message: TaskResultMessage,
) {
    let entry = shared.lock_tasks().remove(&message.task_id);

    // Release the worker before publishing so no observable result ever
    // refers to a still-held acquisition.
    {
        let mut slots = shared.lock_slots();
        let slot = &mut slots[slot_idx];
        if slot.generation == generation && matches!(slot.state, SlotState::Busy(_)) {
            slot.state = SlotState::Idle;
            let _ = shared.idle_tx.send(IdleToken {
                slot: slot_idx,
                generation,
            });
        }
    }

    let Some(entry) = entry else {
        // The supervisor already claimed this task (deadline race).
        debug!(pool = %shared.label, task = message.task_id, "Dropping late result");
        return;
    };

    let queue_wait_ms = entry
        .dispatched_at
        .map(|d| (d - entry.admitted_at).as_secs_f64() * 1000.0);
    let duration_ms = (message.ended_at - message.started_at)
        .to_std()
        .ok()
        .map(|d| d.as_secs_f64() * 1000.0);

    let result = ExecutionResult {
        success: message.success,
        data: message.data,
        error: message.error,
        started_at: Some(message.started_at),
        ended_at: Some(message.ended_at),
        queue_wait_ms,
        duration_ms,
        worker_pid: Some(message.pid),
        response_meta: message.response_meta,
    };
    shared.publish(entry, result);
}

async fn handle_worker_exit(shared: &Arc<PoolShared>, slot_idx: usize, generation: u64) {
    let (previous_state, child, pid) = {
        let mut slots = shared.lock_slots();
        let slot = &mut slots[slot_idx];
        if slot.generation != generation {
            return;
        }
        let state = std::mem::replace(&mut slot.state, SlotState::Dead);
        slot.stdin = None;
        (state, slot.child.take(), slot.pid)
    };

    let exit_code = match child {
        Some(mut child) => child.wait().await.ok().and_then(|status| status.code()),
        None => None,
    };

    match previous_state {
        SlotState::Busy(busy) => {
            // Crash while executing: the task entry is still ours to publish.
            if let Some(entry) = shared.lock_tasks().remove(&busy.task_id) {
                error!(pool = %shared.label, pid, exit_code,
                       task = busy.task_id, "Worker crashed while busy");
                let mut result = ExecutionResult::fail(
                    ExecutionError::new(
                        ErrorKind::System,
                        format!("worker {pid} exited without producing a result"),
                    )
                    .with_details(serde_json::json!({
                        "exitCode": exit_code,
                        "taskId": busy.task_id,
                    })),
                );
                result.started_at = entry.dispatched_wall;
                result.ended_at = Some(Utc::now());
                result.worker_pid = Some(pid);
                result.queue_wait_ms = entry
                    .dispatched_at
                    .map(|d| (d - entry.admitted_at).as_secs_f64() * 1000.0);
                shared.publish(entry, result);
                if let Some(metrics) = &shared.metrics {
                    metrics.record_worker_restart(&shared.label, "crash");
                }
            }
        }
        SlotState::Killing => {
            // Deadline kill; the supervisor already published the timeout.
            debug!(pool = %shared.label, pid, exit_code, "Killed worker reaped");
        }
        SlotState::Idle => {
            if !shared.is_stopping() {
                warn!(pool = %shared.label, pid, exit_code, "Worker exited while idle");
            }
        }
        SlotState::Dead => {}
    }

    if shared.is_stopping() {
        return;
    }
    tokio::spawn(respawn_with_retry(Arc::clone(shared), slot_idx));
}

// ---------------------------------------------------------------------------
// Supervisor (hard deadlines)
// ---------------------------------------------------------------------------

async fn run_supervisor(shared: Arc<PoolShared>) {
    loop {
        if shared.is_stopping() {
            return;
        }

        let nearest: Option<Instant> = shared
            .lock_slots()
            .iter()
            .filter_map(|slot| match &slot.state {
                SlotState::Busy(busy) => busy.deadline,
                _ => None,
            })
            .min();

        match nearest {
            None => shared.deadline_notify.notified().await,
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        kill_expired(&shared).await;
                    }
                    // A new busy worker may carry an earlier deadline.
                    _ = shared.deadline_notify.notified() => {}
                }
            }
        }
    }
}

async fn kill_expired(shared: &Arc<PoolShared>) {
    let now = Instant::now();
    let victims: Vec<(usize, u64, u32, BusyTask)> = shared
        .lock_slots()
        .iter()
        .enumerate()
        .filter_map(|(idx, slot)| match &slot.state {
            SlotState::Busy(busy) if busy.deadline.is_some_and(|d| now >= d) => {
                Some((idx, slot.generation, slot.pid, busy.clone()))
            }
            _ => None,
        })
        .collect();

    for (slot_idx, generation, pid, busy) in victims {
        // Claiming the pending entry decides the race against a result that
        // lands at the same instant; without the entry there is nothing to
        // time out.
        let Some(entry) = shared.lock_tasks().remove(&busy.task_id) else {
            continue;
        };

        let owns_worker = {
            let mut slots = shared.lock_slots();
            let slot = &mut slots[slot_idx];
            let current = slot.generation == generation
                && matches!(&slot.state, SlotState::Busy(b) if b.task_id == busy.task_id);
            if current {
                slot.state = SlotState::Killing;
                slot.stdin = None;
            }
            current
        };

        warn!(pool = %shared.label, pid, task = busy.task_id,
              kill_tree = busy.kill_tree, "Hard timeout, killing worker");

        let mut result = ExecutionResult::fail(ExecutionError::new(
            ErrorKind::Timeout,
            format!("hard execution timeout; worker {pid} killed"),
        ));
        result.started_at = entry.dispatched_wall;
        result.ended_at = Some(Utc::now());
        result.worker_pid = Some(pid);
        result.queue_wait_ms = entry
            .dispatched_at
            .map(|d| (d - entry.admitted_at).as_secs_f64() * 1000.0);
        shared.publish(entry, result);

        if let Some(metrics) = &shared.metrics {
            metrics.record_worker_restart(&shared.label, "timeout");
        }

        if owns_worker {
            signal_worker(pid, busy.kill_tree, KillSignal::Graceful);
            let shared = Arc::clone(shared);
            let grace = busy.kill_grace;
            let kill_tree = busy.kill_tree;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let still_killing = {
                    let slots = shared.lock_slots();
                    let slot = &slots[slot_idx];
                    slot.generation == generation && matches!(slot.state, SlotState::Killing)
                };
                if still_killing {
                    warn!(pool = %shared.label, pid, "Worker survived SIGTERM, sending SIGKILL");
                    signal_worker(pid, kill_tree, KillSignal::Force);
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

enum KillSignal {
    Graceful,
    Force,
}

#[cfg(unix)]
fn signal_worker(pid: u32, kill_tree: bool, signal: KillSignal) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        KillSignal::Graceful => Signal::SIGTERM,
        KillSignal::Force => Signal::SIGKILL,
    };
    let pid = Pid::from_raw(pid as i32);
    // Workers run in their own process group (pgid == pid), so killpg
    // reaches anything they spawned.
    let result = if kill_tree {
        killpg(pid, signal)
    } else {
        kill(pid, signal)
    };
    if let Err(e) = result {
        debug!(?pid, error = %e, "Signal delivery failed (worker likely already gone)");
    }
}

#[cfg(not(unix))]
fn signal_worker(pid: u32, _kill_tree: bool, _signal: KillSignal) {
    // No process groups here; TerminateProcess semantics are covered by
    // kill_on_drop when the child handle is reaped.
    debug!(pid, "signal_worker is a no-op on this platform");
}
