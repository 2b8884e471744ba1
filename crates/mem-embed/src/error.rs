use thiserror::Error;

/// Domain error for the embedding subsystem (§4.4–§4.6). Richer than
/// `mem_core::StoreError` because it must also represent provider-call
/// failures; converts from the store error with `#[from]` the way `at-core`
/// layers its own domain errors over a lower crate's in the pack.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error(transparent)]
    Store(#[from] mem_core::StoreError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Errors from the external embedding provider call (§6 "Provider API").
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited (429)")]
    RateLimited,
    #[error("server error ({status})")]
    ServerError { status: u16 },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("client error ({status}): {message}")]
    ClientError { status: u16, message: String },
}

impl ProviderError {
    /// §4.4 step 5: "retryable failure (network error, HTTP 429, HTTP 5xx,
    /// malformed JSON)".
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_) | ProviderError::RateLimited | ProviderError::ServerError { .. } | ProviderError::Malformed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;
