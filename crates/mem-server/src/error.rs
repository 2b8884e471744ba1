use thiserror::Error;

use mem_core::{ApiErrorDetail, ErrorKind, StoreError};

/// Transport-facing error, carrying the stable `ApiErrorDetail` the envelope
/// and JSON-RPC mapping both read from (§4.12, §7).
#[derive(Debug, Error)]
#[error("{detail}", detail = self.detail.message)]
pub struct ApiError {
    pub detail: ApiErrorDetail,
}

impl ApiError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self { detail: ApiErrorDetail::new(kind, code, message, retryable) }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self { detail: e.into() }
    }
}

impl From<mem_session::SessionError> for ApiError {
    fn from(e: mem_session::SessionError) -> Self {
        Self::new(ErrorKind::InternalError, "TOOL_EXECUTION_FAILED", e.to_string(), true)
    }
}

impl From<mem_embed::EmbeddingError> for ApiError {
    fn from(e: mem_embed::EmbeddingError) -> Self {
        Self::new(ErrorKind::InternalError, "TOOL_EXECUTION_FAILED", e.to_string(), true)
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        Self::new(ErrorKind::InternalError, "TOOL_EXECUTION_FAILED", e.to_string(), true)
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
