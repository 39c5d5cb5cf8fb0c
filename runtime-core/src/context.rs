//! Task-local execution context
//!
//! An executor installs a scope before invoking user code and clears it
//! afterwards. Inside `run`, algorithm code can read the identifiers of the
//! request being served and stage response metadata (code, message, context)
//! that the transport layer applies on top of the default envelope mapping.
//!
//! The store is strictly scoped to one execution: entering a scope resets any
//! staged metadata, and the guard clears everything on drop, so state never
//! leaks between tasks. In multi-process backends the captured metadata
//! travels back to the parent inside the result frame.

use std::cell::RefCell;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::AlgorithmContext;

/// Response metadata staged by user code during one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    /// Override for the envelope `code`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,

    /// Override for the envelope `message`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Override for the envelope `context`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<AlgorithmContext>,
}

impl ResponseMeta {
    /// True when no field has been staged.
    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.message.is_none() && self.context.is_none()
    }
}

#[derive(Debug, Default)]
struct ExecutionScope {
    request_id: Option<String>,
    trace_id: Option<String>,
    context: Option<AlgorithmContext>,
    request_datetime: Option<DateTime<Utc>>,
    response: ResponseMeta,
}

thread_local! {
    static SCOPE: RefCell<Option<ExecutionScope>> = const { RefCell::new(None) };
}

/// Guard returned by [`install`]; clears the scope when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    _private: (),
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        SCOPE.with(|s| *s.borrow_mut() = None);
    }
}

/// Install the execution context for the current task.
///
/// Any previously staged response metadata is discarded; the returned guard
/// clears the scope again on drop.
pub fn install(
    request_id: Option<String>,
    trace_id: Option<String>,
    context: Option<AlgorithmContext>,
    request_datetime: Option<DateTime<Utc>>,
) -> ContextGuard {
    SCOPE.with(|s| {
        *s.borrow_mut() = Some(ExecutionScope {
            request_id,
            trace_id,
            context,
            request_datetime,
            response: ResponseMeta::default(),
        });
    });
    ContextGuard { _private: () }
}

/// Request id of the execution currently bound to this task.
pub fn current_request_id() -> Option<String> {
    SCOPE.with(|s| s.borrow().as_ref().and_then(|e| e.request_id.clone()))
}

/// Trace id of the execution currently bound to this task.
pub fn current_trace_id() -> Option<String> {
    SCOPE.with(|s| s.borrow().as_ref().and_then(|e| e.trace_id.clone()))
}

/// Caller context of the execution currently bound to this task.
pub fn current_context() -> Option<AlgorithmContext> {
    SCOPE.with(|s| s.borrow().as_ref().and_then(|e| e.context.clone()))
}

/// Request timestamp of the execution currently bound to this task.
pub fn current_request_datetime() -> Option<DateTime<Utc>> {
    SCOPE.with(|s| s.borrow().as_ref().and_then(|e| e.request_datetime))
}

fn with_response<F: FnOnce(&mut ResponseMeta)>(f: F) {
    SCOPE.with(|s| {
        if let Some(scope) = s.borrow_mut().as_mut() {
            f(&mut scope.response);
        }
    });
}

/// Stage an override for the response `code`.
pub fn set_response_code(code: i64) {
    with_response(|m| m.code = Some(code));
}

/// Stage an override for the response `message`.
pub fn set_response_message(message: impl Into<String>) {
    with_response(|m| m.message = Some(message.into()));
}

/// Stage an override for the response `context`.
pub fn set_response_context(context: AlgorithmContext) {
    with_response(|m| m.context = Some(context));
}

/// Consume whatever metadata user code staged in the current scope.
///
/// Executors call this after `run` returns or fails; returns `None` when
/// nothing was staged (or no scope is installed).
pub fn take_response_meta() -> Option<ResponseMeta> {
    SCOPE.with(|s| {
        s.borrow_mut().as_mut().and_then(|scope| {
            if scope.response.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut scope.response))
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(trace: &str) -> AlgorithmContext {
        AlgorithmContext {
            trace_id: Some(trace.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn getters_reflect_installed_scope() {
        let when: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let _guard = install(
            Some("r1".into()),
            Some("t1".into()),
            Some(ctx("t1")),
            Some(when),
        );
        assert_eq!(current_request_id().as_deref(), Some("r1"));
        assert_eq!(current_trace_id().as_deref(), Some("t1"));
        assert_eq!(current_request_datetime(), Some(when));
        assert_eq!(current_context().unwrap().trace_id.as_deref(), Some("t1"));
    }

    #[test]
    fn guard_clears_scope_on_drop() {
        {
            let _guard = install(Some("r1".into()), None, None, None);
            assert!(current_request_id().is_some());
        }
        assert!(current_request_id().is_none());
        assert!(take_response_meta().is_none());
    }

    #[test]
    fn staged_meta_is_consumed_once() {
        let _guard = install(Some("r1".into()), None, None, None);
        set_response_code(201);
        set_response_message("created");
        set_response_context(ctx("rt"));

        let meta = take_response_meta().unwrap();
        assert_eq!(meta.code, Some(201));
        assert_eq!(meta.message.as_deref(), Some("created"));
        assert_eq!(meta.context.unwrap().trace_id.as_deref(), Some("rt"));
        assert!(take_response_meta().is_none());
    }

    #[test]
    fn new_scope_resets_previous_meta() {
        let guard = install(Some("r1".into()), None, None, None);
        set_response_code(500);
        drop(guard);

        let _guard = install(Some("r2".into()), None, None, None);
        assert!(take_response_meta().is_none());
    }

    #[test]
    fn setters_without_scope_are_noops() {
        set_response_code(7);
        assert!(take_response_meta().is_none());
    }
}
