//! Error Taxonomy & Envelope (C12): the canonical `{ok, data, error, meta}`
//! tool response shape (§4.12, §7) shared by every MCP tool result and REST
//! error response, and the `ApiErrorDetail` carried in JSON-RPC error data.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::StoreError;

/// Stable error kinds (§7). The enum is the *kind*; `code` narrows it to the
/// machine-readable string transports map onto JSON-RPC/HTTP codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    AuthError,
    RateLimitError,
    NotFoundError,
    ToolError,
    MethodError,
    InternalError,
}

/// `{code, message, data}` carried as JSON-RPC error `data`, or flattened
/// into a REST `error` field (§4.12).
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorDetail {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ApiErrorDetail {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self { kind, code, message: message.into(), retryable }
    }

    /// JSON-RPC numeric error code for this detail (§7 table).
    pub fn rpc_code(&self) -> i32 {
        match self.code {
            "METHOD_NOT_FOUND" => -32601,
            "TENANT_DATABASE_NOT_CONFIGURED" | "DATABASE_NOT_CONFIGURED" | "TENANT_DATABASE_CREDENTIALS_MISSING" => -32004,
            "TENANT_DATABASE_NOT_READY" => -32009,
            "TOOL_EXECUTION_FAILED" | "TENANT_ROUTING_CONTEXT_MISSING" | "USER_CONTEXT_MISSING" | "EMBEDDING_MODEL_CATALOG_FETCH_FAILED" => -32603,
            _ => match self.kind {
                ErrorKind::ValidationError => -32602,
                ErrorKind::MethodError => -32601,
                ErrorKind::NotFoundError => -32004,
                ErrorKind::InternalError => -32603,
                _ => -32603,
            },
        }
    }

    /// HTTP status code for this detail (§7 table).
    pub fn http_status(&self) -> u16 {
        match self.kind {
            ErrorKind::ValidationError => 400,
            ErrorKind::AuthError => 401,
            ErrorKind::RateLimitError => 429,
            ErrorKind::NotFoundError => 404,
            ErrorKind::ToolError => 409,
            ErrorKind::MethodError => 404,
            ErrorKind::InternalError => 500,
        }
    }
}

impl From<&StoreError> for ApiErrorDetail {
    fn from(e: &StoreError) -> Self {
        let code = e.code();
        let kind = match code {
            "MEMORY_NOT_FOUND" | "STREAM_NOT_FOUND" => ErrorKind::NotFoundError,
            "TOOL_EXECUTION_FAILED" => ErrorKind::InternalError,
            _ => ErrorKind::ValidationError,
        };
        ApiErrorDetail::new(kind, code, e.to_string(), e.is_retryable())
    }
}

impl From<StoreError> for ApiErrorDetail {
    fn from(e: StoreError) -> Self {
        ApiErrorDetail::from(&e)
    }
}

/// Response metadata attached to every tool envelope (§4.12).
#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeMeta {
    pub version: &'static str,
    pub tool: &'static str,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub timestamp: DateTime<Utc>,
}

fn serialize_rfc3339<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.to_rfc3339())
}

/// The canonical tool envelope, `{ok, data, error, meta}`, merged with
/// tool-specific fields at serialization time (§9 "Structured tool
/// envelopes": flatten so legacy clients can read either shape).
#[derive(Debug, Clone, Serialize)]
pub struct ToolEnvelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorDetail>,
    pub meta: EnvelopeMeta,
}

impl ToolEnvelope {
    pub fn ok(tool: &'static str, data: Value, now: DateTime<Utc>) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            meta: EnvelopeMeta { version: ENVELOPE_VERSION, tool, timestamp: now },
        }
    }

    pub fn err(tool: &'static str, error: ApiErrorDetail, now: DateTime<Utc>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
            meta: EnvelopeMeta { version: ENVELOPE_VERSION, tool, timestamp: now },
        }
    }

    /// Flatten tool-specific top-level fields (from `data`, an object) in
    /// with `{ok, error, meta}` so both `structuredContent.ok` and e.g.
    /// `structuredContent.rules` resolve (§9).
    pub fn to_flattened_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("ok".to_string(), Value::Bool(self.ok));
        if let Some(Value::Object(data_obj)) = &self.data {
            for (k, v) in data_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        if let Some(data) = &self.data {
            obj.insert("data".to_string(), data.clone());
        }
        if let Some(err) = &self.error {
            obj.insert("error".to_string(), serde_json::to_value(err).unwrap_or(Value::Null));
        }
        obj.insert("meta".to_string(), serde_json::to_value(&self.meta).unwrap_or(Value::Null));
        Value::Object(obj)
    }
}

pub const ENVELOPE_VERSION: &str = "1";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn ok_envelope_flattens_data_fields_alongside_data() {
        let env = ToolEnvelope::ok("get_rules", json!({"rules": [1, 2, 3]}), now());
        let flat = env.to_flattened_json();
        assert_eq!(flat["ok"], json!(true));
        assert_eq!(flat["rules"], json!([1, 2, 3]));
        assert_eq!(flat["data"]["rules"], json!([1, 2, 3]));
    }

    #[test]
    fn err_envelope_carries_error_detail() {
        let detail = ApiErrorDetail::new(ErrorKind::ValidationError, "MEMORY_CONTENT_REQUIRED", "content required", false);
        let env = ToolEnvelope::err("add_memory", detail, now());
        let flat = env.to_flattened_json();
        assert_eq!(flat["ok"], json!(false));
        assert_eq!(flat["error"]["code"], json!("MEMORY_CONTENT_REQUIRED"));
    }

    #[test]
    fn store_error_not_found_maps_to_not_found_kind() {
        let err = StoreError::not_found("MEMORY_NOT_FOUND", "no such memory");
        let detail: ApiErrorDetail = err.into();
        assert_eq!(detail.kind, ErrorKind::NotFoundError);
        assert_eq!(detail.http_status(), 404);
    }

    #[test]
    fn method_not_found_maps_to_rpc_32601() {
        let detail = ApiErrorDetail::new(ErrorKind::MethodError, "METHOD_NOT_FOUND", "unknown method", false);
        assert_eq!(detail.rpc_code(), -32601);
    }

    #[test]
    fn tenant_not_ready_maps_to_rpc_32009() {
        let detail = ApiErrorDetail::new(ErrorKind::ToolError, "TENANT_DATABASE_NOT_READY", "not ready", true);
        assert_eq!(detail.rpc_code(), -32009);
    }
}
