//! End-to-end supervision tests for the process pool
//!
//! These run against real worker processes: the pool spawns `current_exe()`
//! in worker mode, which is this test binary, so `main` first offers itself
//! to the worker loop before driving the scenarios. That re-entry is why the
//! file opts out of the libtest harness.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use algoserve_runtime_core::execution::{
    DispatchingExecutor, ErrorKind, ExecutionRequest, Executor, PoolConfig, ProcessPoolExecutor,
};
use algoserve_runtime_core::registry::AlgorithmRegistry;
use algoserve_runtime_core::settings::RuntimeSettings;
use serde_json::json;

fn main() {
    let registry = support::build_registry();
    if algoserve_runtime_core::worker::maybe_run_worker(&registry) {
        return;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");

    runtime.block_on(async {
        let registry = Arc::new(registry);
        run("happy_path", happy_path(&registry)).await;
        run("hard_timeout_replaces_worker", hard_timeout_replaces_worker(&registry)).await;
        run("queued_deadline_expires_before_start", queued_deadline(&registry)).await;
        run("rejection_under_load", rejection_under_load(&registry)).await;
        run("crash_is_reported_and_pool_recovers", crash_recovery(&registry)).await;
        run("stateful_state_survives_until_kill", stateful_reset(&registry)).await;
        run("response_meta_crosses_process_boundary", response_meta(&registry)).await;
        run("isolated_pools_do_not_starve_each_other", isolation(&registry)).await;
        run("shutdown_rejects_new_submits", shutdown_rejects(&registry)).await;
    });

    println!("all pool supervision scenarios passed");
}

async fn run(name: &str, scenario: impl std::future::Future<Output = ()>) {
    println!("scenario {name} ...");
    scenario.await;
    println!("scenario {name} ok");
}

fn pool_config(max_workers: usize, queue_size: usize) -> PoolConfig {
    PoolConfig {
        label: "test".to_string(),
        max_workers,
        queue_size,
        admit_timeout: Duration::from_millis(300),
        default_timeout: None,
        kill_grace: Duration::from_millis(500),
        kill_tree: false,
        spawn_timeout: Duration::from_secs(30),
    }
}

fn request(
    registry: &AlgorithmRegistry,
    name: &str,
    payload: serde_json::Value,
    request_id: &str,
) -> ExecutionRequest {
    let spec = registry.get(name, "v1").expect("fixture registered");
    ExecutionRequest::new(spec, payload, request_id)
}

async fn happy_path(registry: &AlgorithmRegistry) {
    let pool = ProcessPoolExecutor::new(pool_config(1, 2), None);
    pool.start().await.expect("pool start");

    let result = pool
        .submit(request(registry, "double", json!({"value": 21}), "r1"))
        .await;
    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.data.unwrap()["doubled"], json!(42));
    assert!(result.worker_pid.is_some());
    assert!(result.started_at.is_some() && result.ended_at.is_some());

    pool.shutdown(true).await.expect("shutdown");
}

async fn hard_timeout_replaces_worker(registry: &AlgorithmRegistry) {
    let pool = ProcessPoolExecutor::new(pool_config(1, 2), None);
    pool.start().await.expect("pool start");

    // Warm up so the timing below measures supervision, not spawn.
    let warm = pool
        .submit(request(registry, "double", json!({"value": 1}), "warmup"))
        .await;
    assert!(warm.success);

    let started = Instant::now();
    let timed_out = pool
        .submit(
            request(registry, "sleeper", json!({"delay_s": 5.0}), "r-timeout")
                .with_timeout(Duration::from_millis(200)),
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(timed_out.error_kind(), Some(ErrorKind::Timeout));
    let killed_pid = timed_out.worker_pid.expect("timeout carries the killed pid");
    assert!(
        elapsed < Duration::from_secs(3),
        "timeout took {elapsed:?}, expected ~deadline + grace"
    );

    // The replacement worker serves the next request.
    let after = pool
        .submit(request(registry, "double", json!({"value": 3}), "r-after"))
        .await;
    assert!(after.success, "after: {:?}", after.error);
    assert_eq!(after.data.unwrap()["doubled"], json!(6));
    assert_ne!(after.worker_pid.unwrap(), killed_pid, "worker was not replaced");

    pool.shutdown(true).await.expect("shutdown");
}

async fn queued_deadline(registry: &AlgorithmRegistry) {
    let pool = Arc::new(ProcessPoolExecutor::new(pool_config(1, 2), None));
    pool.start().await.expect("pool start");

    let warm = pool
        .submit(request(registry, "double", json!({"value": 1}), "warmup"))
        .await;
    assert!(warm.success);

    // Occupy the only worker for a while.
    let long = {
        let pool = Arc::clone(&pool);
        let req = request(registry, "sleeper", json!({"delay_s": 0.8}), "r-long")
            .with_timeout(Duration::from_secs(5));
        tokio::spawn(async move { pool.submit(req).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // This one can never start before its deadline.
    let queued = pool
        .submit(
            request(registry, "sleeper", json!({"delay_s": 0.01}), "r-queued")
                .with_timeout(Duration::from_millis(150)),
        )
        .await;
    assert_eq!(queued.error_kind(), Some(ErrorKind::Timeout));
    let message = queued.error.unwrap().message;
    assert!(
        message.contains("before execution started"),
        "unexpected message: {message}"
    );
    assert!(queued.worker_pid.is_none(), "no worker was involved");

    // The busy worker was not disturbed.
    let long = long.await.expect("join");
    assert!(long.success, "long request failed: {:?}", long.error);

    pool.shutdown(true).await.expect("shutdown");
}

async fn rejection_under_load(registry: &AlgorithmRegistry) {
    let pool = Arc::new(ProcessPoolExecutor::new(pool_config(1, 1), None));
    pool.start().await.expect("pool start");

    let warm = pool
        .submit(request(registry, "double", json!({"value": 1}), "warmup"))
        .await;
    assert!(warm.success);

    let mut handles = Vec::new();
    for i in 0..3 {
        let pool = Arc::clone(&pool);
        let req = request(registry, "sleeper", json!({"delay_s": 0.6}), &format!("r-{i}"))
            .with_timeout(Duration::from_secs(2));
        handles.push(tokio::spawn(async move { pool.submit(req).await }));
    }

    let mut successes = 0;
    let mut rejections = 0;
    for handle in handles {
        let result = handle.await.expect("join");
        match result.error_kind() {
            None => successes += 1,
            Some(ErrorKind::Rejected) => rejections += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert!(successes >= 1, "at least one request must get through");
    assert!(rejections >= 1, "the slowest-admitted must be rejected");

    pool.shutdown(true).await.expect("shutdown");
}

async fn crash_recovery(registry: &AlgorithmRegistry) {
    let pool = ProcessPoolExecutor::new(pool_config(1, 2), None);
    pool.start().await.expect("pool start");

    let crashed = pool
        .submit(
            request(registry, "crasher", json!({"code": 3}), "r-crash")
                .with_timeout(Duration::from_secs(2)),
        )
        .await;
    assert_eq!(crashed.error_kind(), Some(ErrorKind::System));
    let error = crashed.error.unwrap();
    assert_eq!(error.details.unwrap()["exitCode"], json!(3));

    let after = pool
        .submit(request(registry, "double", json!({"value": 5}), "r-after"))
        .await;
    assert!(after.success, "after crash: {:?}", after.error);
    assert_eq!(after.data.unwrap()["doubled"], json!(10));

    pool.shutdown(true).await.expect("shutdown");
}

async fn stateful_reset(registry: &AlgorithmRegistry) {
    let pool = ProcessPoolExecutor::new(pool_config(1, 2), None);
    pool.start().await.expect("pool start");

    let first = pool
        .submit(request(registry, "stateful", json!({"value": 1}), "r-1"))
        .await;
    assert!(first.success, "{:?}", first.error);
    let first = first.data.unwrap();
    assert_eq!(first["calls"], json!(1));
    let instance = first["instance_id"].as_str().unwrap().to_string();

    // Same worker, same cached instance.
    let second = pool
        .submit(request(registry, "stateful", json!({"value": 2}), "r-2"))
        .await;
    let second = second.data.unwrap();
    assert_eq!(second["instance_id"].as_str().unwrap(), instance);
    assert_eq!(second["calls"], json!(2));

    // A deadline kill takes the cached instance with it.
    let killed = pool
        .submit(
            request(registry, "sleeper", json!({"delay_s": 5.0}), "r-kill")
                .with_timeout(Duration::from_millis(200)),
        )
        .await;
    assert_eq!(killed.error_kind(), Some(ErrorKind::Timeout));

    let third = pool
        .submit(request(registry, "stateful", json!({"value": 3}), "r-3"))
        .await;
    let third = third.data.unwrap();
    assert_ne!(
        third["instance_id"].as_str().unwrap(),
        instance,
        "replacement worker must build a fresh instance"
    );
    assert_eq!(third["calls"], json!(1));

    pool.shutdown(true).await.expect("shutdown");
}

async fn response_meta(registry: &AlgorithmRegistry) {
    let pool = ProcessPoolExecutor::new(pool_config(1, 2), None);
    pool.start().await.expect("pool start");

    // Staged metadata travels back on success...
    let ok = pool
        .submit(request(registry, "meta", json!({"fail": false}), "r-ok"))
        .await;
    assert!(ok.success);
    let meta = ok.response_meta.expect("meta staged");
    assert_eq!(meta.code, Some(201));
    assert_eq!(meta.message.as_deref(), Some("created"));
    assert_eq!(meta.context.unwrap().trace_id.as_deref(), Some("rt"));

    // ...and survives a user-code failure.
    let failed = pool
        .submit(request(registry, "meta", json!({"fail": true}), "r-fail"))
        .await;
    assert_eq!(failed.error_kind(), Some(ErrorKind::Runtime));
    let meta = failed.response_meta.expect("meta staged before failure");
    assert_eq!(meta.code, Some(201));

    pool.shutdown(true).await.expect("shutdown");
}

async fn isolation(registry: &AlgorithmRegistry) {
    let settings = RuntimeSettings {
        global_max_workers: 1,
        global_queue_size: 4,
        admit_timeout: Duration::from_millis(300),
        kill_grace: Duration::from_millis(500),
        ..RuntimeSettings::default()
    };
    let dispatcher = Arc::new(DispatchingExecutor::new(&settings, None));
    dispatcher.start().await.expect("dispatcher start");

    // Keep the isolated sleeper pool permanently timing out.
    let sleeper = {
        let dispatcher = Arc::clone(&dispatcher);
        let req = request(registry, "iso-sleeper", json!({"delay_s": 30.0}), "r-hog");
        tokio::spawn(async move { dispatcher.submit(req).await })
    };

    // Its own pool must keep serving regardless.
    for i in 0..3 {
        let result = dispatcher
            .submit(request(registry, "iso-double", json!({"value": i}), &format!("r-{i}")))
            .await;
        assert!(result.success, "iso-double failed: {:?}", result.error);
        assert_eq!(result.data.unwrap()["doubled"], json!(i * 2));
    }

    let hog = sleeper.await.expect("join");
    assert_eq!(hog.error_kind(), Some(ErrorKind::Timeout));

    dispatcher.shutdown(false).await.expect("shutdown");
}

async fn shutdown_rejects(registry: &AlgorithmRegistry) {
    let pool = ProcessPoolExecutor::new(pool_config(1, 2), None);
    pool.start().await.expect("pool start");
    pool.shutdown(true).await.expect("shutdown");

    let result = pool
        .submit(request(registry, "double", json!({"value": 1}), "r-late"))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Rejected));
}
