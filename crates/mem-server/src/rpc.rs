//! JSON-RPC 2.0 envelope and method dispatch (§4.10, §6).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use mem_core::ApiErrorDetail;

use crate::error::ApiError;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ApiErrorDetail>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    pub fn err(id: Option<Value>, detail: ApiErrorDetail) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError { code: detail.rpc_code(), message: detail.message.clone(), data: Some(detail) }),
        }
    }

    pub fn parse_error() -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            result: None,
            error: Some(JsonRpcError { code: -32700, message: "parse error".to_string(), data: None }),
        }
    }

    pub fn invalid_request(id: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError { code: -32600, message: "invalid request".to_string(), data: None }),
        }
    }
}

/// `initialize` result (§4.10).
pub fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "serverInfo": {"name": "mem-serve", "version": env!("CARGO_PKG_VERSION")},
        "capabilities": {"tools": {}}
    })
}

pub fn tools_list_result() -> Value {
    json!({"tools": crate::tools::catalog()})
}

/// Thin wrapper so the HTTP layer can always produce a `JsonRpcResponse`,
/// regardless of which step of dispatch failed.
pub fn error_response(id: Option<Value>, err: ApiError) -> JsonRpcResponse {
    JsonRpcResponse::err(id, err.detail)
}

pub fn method_not_found(id: Option<Value>, method: &str) -> JsonRpcResponse {
    error_response(
        id,
        ApiError::new(mem_core::ErrorKind::MethodError, "METHOD_NOT_FOUND", format!("unknown method '{method}'"), false),
    )
}
