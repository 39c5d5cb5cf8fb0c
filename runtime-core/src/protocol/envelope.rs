//! Request and response envelopes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Business outcome codes carried in the response envelope.
///
/// HTTP status stays 200 for every business outcome; these codes are the
/// authoritative result. Transport-level statuses (400/404/503) are reserved
/// for pre-dispatch failures.
pub mod codes {
    /// Successful execution
    pub const SUCCESS: i64 = 0;
    /// Malformed envelope (unknown top-level field, empty requestId, ...)
    pub const BAD_ENVELOPE: i64 = 40000;
    /// Input failed schema validation
    pub const INVALID_INPUT: i64 = 40001;
    /// No algorithm registered under (name, version)
    pub const NOT_FOUND: i64 = 40400;
    /// Admission queue full or executor shutting down
    pub const REJECTED: i64 = 42900;
    /// Worker died without producing a result
    pub const SYSTEM: i64 = 50000;
    /// User code returned an error or panicked
    pub const RUNTIME: i64 = 50001;
    /// Hard execution timeout
    pub const TIMEOUT: i64 = 50400;
}

/// Opaque per-request context passed through to user code.
///
/// Unknown keys inside `extra` are preserved verbatim; the struct itself is
/// lenient about unrecognized fields since callers own its meaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmContext {
    /// Distributed trace identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Tenant identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// End-user identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Arbitrary additional context values
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// Standardized algorithm request envelope.
///
/// Top-level fields are strict: unknown keys are rejected so that client
/// typos surface as `40000` instead of being silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlgorithmRequest<T = Value> {
    /// Caller-supplied request identifier, must be non-empty
    pub request_id: String,

    /// Request timestamp (ISO-8601, UTC); echoed back in the response
    pub datetime: DateTime<Utc>,

    /// Optional pass-through context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<AlgorithmContext>,

    /// Algorithm-specific input payload
    pub data: T,
}

impl<T> AlgorithmRequest<T> {
    /// Check envelope-level constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_id.trim().is_empty() {
            return Err("requestId must be non-empty".to_string());
        }
        Ok(())
    }

    /// Trace id from the embedded context, if any.
    pub fn trace_id(&self) -> Option<&str> {
        self.context.as_ref().and_then(|c| c.trace_id.as_deref())
    }
}

/// Standardized algorithm response envelope.
///
/// `datetime` echoes the request timestamp rather than the server clock, and
/// `context` is only populated when user code explicitly staged one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmResponse<T = Value> {
    /// Business outcome code (see [`codes`])
    pub code: i64,

    /// Human-readable outcome message
    pub message: String,

    /// Echoed request identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Echoed request timestamp
    pub datetime: DateTime<Utc>,

    /// Context staged by user code, `null` otherwise
    pub context: Option<AlgorithmContext>,

    /// Output payload, `null` on failure
    pub data: Option<T>,
}

/// Wrap a successful result into a response envelope.
pub fn api_success<T>(
    data: Option<T>,
    request_id: Option<String>,
    datetime: DateTime<Utc>,
    context: Option<AlgorithmContext>,
) -> AlgorithmResponse<T> {
    AlgorithmResponse {
        code: codes::SUCCESS,
        message: "success".to_string(),
        request_id,
        datetime,
        context,
        data,
    }
}

/// Wrap an error outcome into a response envelope.
pub fn api_error<T>(
    code: i64,
    message: impl Into<String>,
    request_id: Option<String>,
    datetime: DateTime<Utc>,
    context: Option<AlgorithmContext>,
) -> AlgorithmResponse<T> {
    AlgorithmResponse {
        code,
        message: message.into(),
        request_id,
        datetime,
        context,
        data: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_json() -> Value {
        json!({
            "requestId": "r1",
            "datetime": "2026-01-01T00:00:00Z",
            "data": {"value": 21}
        })
    }

    #[test]
    fn parses_minimal_request() {
        let req: AlgorithmRequest = serde_json::from_value(request_json()).unwrap();
        assert_eq!(req.request_id, "r1");
        assert!(req.context.is_none());
        req.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_top_level_field() {
        let mut body = request_json();
        body["surprise"] = json!(true);
        let parsed: Result<AlgorithmRequest, _> = serde_json::from_value(body);
        assert!(parsed.is_err());
    }

    #[test]
    fn nested_data_stays_lenient() {
        let mut body = request_json();
        body["data"]["unknownNested"] = json!("kept");
        let req: AlgorithmRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.data["unknownNested"], json!("kept"));
    }

    #[test]
    fn blank_request_id_fails_validation() {
        let mut body = request_json();
        body["requestId"] = json!("   ");
        let req: AlgorithmRequest = serde_json::from_value(body).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn context_extra_roundtrips() {
        let ctx: AlgorithmContext = serde_json::from_value(json!({
            "traceId": "t-1",
            "tenantId": "acme",
            "extra": {"region": "eu-1", "attempt": 2}
        }))
        .unwrap();
        assert_eq!(ctx.trace_id.as_deref(), Some("t-1"));
        let back = serde_json::to_value(&ctx).unwrap();
        assert_eq!(back["extra"]["region"], json!("eu-1"));
    }

    #[test]
    fn success_envelope_serializes_null_context_and_data() {
        let resp: AlgorithmResponse = api_success(
            Some(json!({"doubled": 42})),
            Some("r1".to_string()),
            "2026-01-01T00:00:00Z".parse().unwrap(),
            None,
        );
        let body = serde_json::to_value(&resp).unwrap();
        assert_eq!(body["code"], json!(0));
        assert_eq!(body["message"], json!("success"));
        assert_eq!(body["context"], Value::Null);
        assert_eq!(body["data"]["doubled"], json!(42));
        assert_eq!(body["datetime"], json!("2026-01-01T00:00:00Z"));
    }
}
