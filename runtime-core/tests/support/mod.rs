//! Shared fixture algorithms for integration tests
//!
//! The pool tests re-enter the test binary in worker mode, so parent and
//! worker must assemble an identical registry; this module is that single
//! source.

use algoserve_runtime_core::context;
use algoserve_runtime_core::registry::AlgorithmRegistry;
use algoserve_runtime_core::spec::{Algorithm, AlgorithmSpec, NoParams};
use algoserve_runtime_core::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct DoubleReq {
    pub value: i64,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct DoubleResp {
    pub doubled: i64,
}

#[derive(Default)]
pub struct DoubleAlgo;

impl Algorithm for DoubleAlgo {
    type Input = DoubleReq;
    type Output = DoubleResp;
    type Params = NoParams;

    fn run(&mut self, req: DoubleReq, _params: Option<NoParams>) -> Result<DoubleResp> {
        Ok(DoubleResp {
            doubled: req.value * 2,
        })
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct SleepReq {
    pub delay_s: f64,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct SleepResp {
    pub done: bool,
}

#[derive(Default)]
pub struct SleepAlgo;

impl Algorithm for SleepAlgo {
    type Input = SleepReq;
    type Output = SleepResp;
    type Params = NoParams;

    fn run(&mut self, req: SleepReq, _params: Option<NoParams>) -> Result<SleepResp> {
        std::thread::sleep(std::time::Duration::from_secs_f64(req.delay_s));
        Ok(SleepResp { done: true })
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct CrashReq {
    pub code: i32,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct CrashResp {
    pub ok: bool,
}

#[derive(Default)]
pub struct CrashAlgo;

impl Algorithm for CrashAlgo {
    type Input = CrashReq;
    type Output = CrashResp;
    type Params = NoParams;

    fn run(&mut self, req: CrashReq, _params: Option<NoParams>) -> Result<CrashResp> {
        // Simulates a segfault / OOM-kill: no result frame is ever written.
        std::process::exit(req.code);
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct StateReq {
    pub value: i64,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct StateResp {
    pub instance_id: String,
    pub calls: u64,
}

pub struct StatefulAlgo {
    instance_id: String,
    calls: u64,
}

impl Default for StatefulAlgo {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            calls: 0,
        }
    }
}

impl Algorithm for StatefulAlgo {
    type Input = StateReq;
    type Output = StateResp;
    type Params = NoParams;

    fn run(&mut self, _req: StateReq, _params: Option<NoParams>) -> Result<StateResp> {
        self.calls += 1;
        Ok(StateResp {
            instance_id: self.instance_id.clone(),
            calls: self.calls,
        })
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct MetaReq {
    pub fail: bool,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct MetaResp {
    pub ok: bool,
}

#[derive(Default)]
pub struct MetaAlgo;

impl Algorithm for MetaAlgo {
    type Input = MetaReq;
    type Output = MetaResp;
    type Params = NoParams;

    fn run(&mut self, req: MetaReq, _params: Option<NoParams>) -> Result<MetaResp> {
        context::set_response_code(201);
        context::set_response_message("created");
        let mut ctx = algoserve_runtime_core::protocol::AlgorithmContext::default();
        ctx.trace_id = Some("rt".to_string());
        context::set_response_context(ctx);
        if req.fail {
            return Err(algoserve_runtime_core::Error::Execution(
                "requested failure".into(),
            ));
        }
        Ok(MetaResp { ok: true })
    }
}

/// The registry both the test driver and its worker children build.
pub fn build_registry() -> AlgorithmRegistry {
    let registry = AlgorithmRegistry::new();

    let specs = vec![
        AlgorithmSpec::builder("double", "v1")
            .created_time("2026-01-01")
            .author("qa")
            .category("test")
            .class::<DoubleAlgo>()
            .build(),
        AlgorithmSpec::builder("sleeper", "v1")
            .created_time("2026-01-01")
            .author("qa")
            .category("test")
            .timeout_secs(10.0)
            .class::<SleepAlgo>()
            .build(),
        AlgorithmSpec::builder("crasher", "v1")
            .created_time("2026-01-01")
            .author("qa")
            .category("test")
            .class::<CrashAlgo>()
            .build(),
        AlgorithmSpec::builder("stateful", "v1")
            .created_time("2026-01-01")
            .author("qa")
            .category("test")
            .stateful(true)
            .timeout_secs(10.0)
            .class::<StatefulAlgo>()
            .build(),
        AlgorithmSpec::builder("meta", "v1")
            .created_time("2026-01-01")
            .author("qa")
            .category("test")
            .class::<MetaAlgo>()
            .build(),
        AlgorithmSpec::builder("iso-sleeper", "v1")
            .created_time("2026-01-01")
            .author("qa")
            .category("test")
            .timeout_secs(0.5)
            .isolated_pool(true)
            .max_workers(1)
            .class::<SleepAlgo>()
            .build(),
        AlgorithmSpec::builder("iso-double", "v1")
            .created_time("2026-01-01")
            .author("qa")
            .category("test")
            .timeout_secs(5.0)
            .isolated_pool(true)
            .max_workers(1)
            .class::<DoubleAlgo>()
            .build(),
    ];

    for spec in specs {
        registry
            .register(spec.expect("fixture spec must build"))
            .expect("fixture spec must register");
    }
    registry
}
