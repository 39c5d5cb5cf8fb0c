//! HTTP server: router and handlers
//!
//! Routes (JSON bodies, camelCase wire fields):
//! - POST /algorithms/:name/:version - execute
//! - GET  /algorithms - enumerate registered specs
//! - GET  /algorithms/:name/:version/schema - I/O schemas and hints
//! - GET  /healthz, /readyz - probes
//! - GET  /metrics - Prometheus text exposition
//! - /admin/lifecycle/* - env-gated lifecycle control

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use algoserve_runtime_core::lifecycle::{ServiceRuntime, ServiceState};
use algoserve_runtime_core::observability::ServiceMetrics;
use algoserve_runtime_core::protocol::{api_error, codes, AlgorithmRequest};
use algoserve_runtime_core::settings::RuntimeSettings;
use algoserve_runtime_core::spec::AlgorithmSpec;
use algoserve_runtime_core::Error as CoreError;

use crate::error::{Error, Result};
use crate::service::AlgorithmHttpService;

/// State shared across handlers.
#[derive(Clone)]
struct AppState {
    service: Arc<AlgorithmHttpService>,
    runtime: Arc<ServiceRuntime>,
    metrics: Arc<ServiceMetrics>,
}

/// HTTP server for the algorithm service.
pub struct HttpServer {
    settings: RuntimeSettings,
    state: AppState,
}

impl HttpServer {
    /// Create a server over the given collaborators.
    pub fn new(
        settings: RuntimeSettings,
        service: Arc<AlgorithmHttpService>,
        runtime: Arc<ServiceRuntime>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            settings,
            state: AppState {
                service,
                runtime,
                metrics,
            },
        }
    }

    /// Build the router with all endpoints.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/", get(root_handler))
            .route("/healthz", get(healthz_handler))
            .route("/readyz", get(readyz_handler))
            .route("/metrics", get(metrics_handler))
            .route("/algorithms", get(list_algorithms_handler))
            .route("/algorithms/:name/:version/schema", get(schema_handler))
            .route("/algorithms/:name/:version", post(invoke_handler));

        if self.settings.admin_enabled {
            router = router
                .route("/admin/lifecycle/state", get(admin_state_handler))
                .route("/admin/lifecycle/running", post(admin_running_handler))
                .route("/admin/lifecycle/degraded", post(admin_degraded_handler))
                .route("/admin/lifecycle/draining", post(admin_draining_handler))
                .route("/admin/lifecycle/stop", post(admin_stop_handler));
        }

        let mut router = router.with_state(self.state.clone()).layer(
            tower::ServiceBuilder::new().layer(tower_http::trace::TraceLayer::new_for_http()),
        );

        if self.settings.cors_enabled {
            let cors = if self.settings.cors_allow_origins.is_empty() {
                tower_http::cors::CorsLayer::permissive()
            } else {
                let origins: Vec<axum::http::HeaderValue> = self
                    .settings
                    .cors_allow_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect();
                tower_http::cors::CorsLayer::new()
                    .allow_origin(origins)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any)
            };
            router = router.layer(cors);
        }

        router
    }

    /// Serve until the shutdown future resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.settings.bind_host, self.settings.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::ServerError(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(%addr, "Starting HTTP server");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::ServerError(format!("server error: {e}")))?;
        Ok(())
    }
}

async fn root_handler() -> Redirect {
    Redirect::temporary("/healthz")
}

async fn healthz_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn readyz_handler(State(state): State<AppState>) -> Response {
    let lifecycle_state = state.runtime.state();
    let lifecycle_ready = matches!(
        lifecycle_state,
        ServiceState::Ready | ServiceState::Running
    );
    let executor_started = state.service.executor_started();

    if lifecycle_ready && executor_started {
        Json(json!({"status": "ready", "state": lifecycle_state.as_str()})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "state": lifecycle_state.as_str(),
                "checks": {
                    "lifecycle": lifecycle_ready,
                    "executorStarted": executor_started,
                }
            })),
        )
            .into_response()
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

fn spec_summary(spec: &AlgorithmSpec) -> Value {
    json!({
        "name": spec.name,
        "version": spec.version,
        "description": spec.description,
        "algorithmType": spec.algorithm_type,
        "createdTime": spec.created_time,
        "author": spec.author,
        "category": spec.category,
        "applicationScenarios": spec.application_scenarios,
        "extra": spec.extra,
    })
}

async fn list_algorithms_handler(State(state): State<AppState>) -> Json<Value> {
    let specs = state.service.registry().list();
    let data: Vec<Value> = specs.iter().map(|spec| spec_summary(spec)).collect();
    let envelope = algoserve_runtime_core::protocol::api_success(
        Some(Value::Array(data)),
        None,
        Utc::now(),
        None,
    );
    Json(serde_json::to_value(envelope).unwrap_or_default())
}

async fn schema_handler(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Json<Value> {
    let envelope = match state.service.registry().get(&name, &version) {
        Ok(spec) => algoserve_runtime_core::protocol::api_success(
            Some(json!({
                "input": spec.input_schema(),
                "output": spec.output_schema(),
                "hyperparams": spec.hyperparams_schema(),
                "execution": spec.execution,
                "algorithmType": spec.algorithm_type,
                "createdTime": spec.created_time,
                "author": spec.author,
                "category": spec.category,
                "applicationScenarios": spec.application_scenarios,
                "extra": spec.extra,
            })),
            None,
            Utc::now(),
            None,
        ),
        Err(e) => api_error(codes::NOT_FOUND, e.to_string(), None, Utc::now(), None),
    };
    Json(serde_json::to_value(envelope).unwrap_or_default())
}

async fn invoke_handler(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Response {
    // Transport-level failure: the body is not even JSON.
    let Json(raw) = match body {
        Ok(json) => json,
        Err(rejection) => {
            let envelope = api_error::<Value>(
                codes::BAD_ENVELOPE,
                format!("malformed request body: {rejection}"),
                None,
                Utc::now(),
                None,
            );
            return (StatusCode::BAD_REQUEST, Json(envelope)).into_response();
        }
    };

    // Envelope decode is strict: unknown top-level fields are a business
    // error with best-effort identifier echo.
    let request: AlgorithmRequest<Value> = match serde_json::from_value(raw.clone()) {
        Ok(request) => request,
        Err(e) => {
            let request_id = raw
                .get("requestId")
                .and_then(Value::as_str)
                .map(str::to_string);
            let datetime = raw
                .get("datetime")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(Utc::now);
            let envelope = api_error::<Value>(
                codes::BAD_ENVELOPE,
                format!("invalid request envelope: {e}"),
                request_id,
                datetime,
                None,
            );
            return Json(envelope).into_response();
        }
    };

    if let Err(message) = request.validate() {
        let envelope = api_error::<Value>(
            codes::BAD_ENVELOPE,
            format!("invalid request envelope: {message}"),
            Some(request.request_id.clone()),
            request.datetime,
            None,
        );
        return Json(envelope).into_response();
    }

    // Lifecycle gate: pre-dispatch refusals use transport statuses, with 429
    // while draining so clients can tell shutdown from overload.
    if !state.runtime.accepting_requests() {
        let lifecycle_state = state.runtime.state();
        let (status, code) = match lifecycle_state {
            ServiceState::Draining => (StatusCode::TOO_MANY_REQUESTS, codes::REJECTED),
            _ => (StatusCode::SERVICE_UNAVAILABLE, codes::SYSTEM),
        };
        let envelope = api_error::<Value>(
            code,
            format!(
                "service not accepting requests: {}",
                lifecycle_state.as_str()
            ),
            Some(request.request_id.clone()),
            request.datetime,
            None,
        );
        return (status, Json(envelope)).into_response();
    }

    let response = state.service.invoke(&name, &version, request).await;
    Json(response).into_response()
}

async fn admin_state_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "state": state.runtime.state().as_str(),
        "acceptingRequests": state.runtime.accepting_requests(),
    }))
}

fn lifecycle_outcome(result: algoserve_runtime_core::Result<()>, state: &AppState) -> Response {
    match result {
        Ok(()) => Json(json!({"state": state.runtime.state().as_str()})).into_response(),
        Err(CoreError::Lifecycle(e)) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "lifecycle", "message": e.to_string()})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "internal", "message": e.to_string()})),
        )
            .into_response(),
    }
}

async fn admin_running_handler(State(state): State<AppState>) -> Response {
    let result = state.runtime.running(Some("admin")).await;
    lifecycle_outcome(result, &state)
}

async fn admin_degraded_handler(State(state): State<AppState>) -> Response {
    let result = state.runtime.degraded(Some("admin")).await;
    lifecycle_outcome(result, &state)
}

async fn admin_draining_handler(State(state): State<AppState>) -> Response {
    let result = state.runtime.draining(Some("admin")).await;
    lifecycle_outcome(result, &state)
}

async fn admin_stop_handler(State(state): State<AppState>) -> Response {
    let result = state.runtime.stop(Some("admin")).await;
    lifecycle_outcome(result, &state)
}
