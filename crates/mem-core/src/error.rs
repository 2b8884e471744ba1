use std::fmt;

/// Stable error kinds for the memory store (§7).
///
/// `code` is the stable machine-readable string (`MEMORY_CONTENT_REQUIRED`,
/// `MEMORY_NOT_FOUND`, ...) that transport layers map onto JSON-RPC/HTTP
/// codes. The enum variant is the *kind*; `code` narrows it.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Validation { code: &'static str, message: String },
    NotFound { code: &'static str, message: String },
    InvalidData(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Validation { code, message } => write!(f, "{code}: {message}"),
            StoreError::NotFound { code, message } => write!(f, "{code}: {message}"),
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl StoreError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        StoreError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        StoreError::NotFound {
            code,
            message: message.into(),
        }
    }

    /// Stable error code for transports mapping this onto JSON-RPC/HTTP (§7).
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Sqlite(_) => "TOOL_EXECUTION_FAILED",
            StoreError::Validation { code, .. } => code,
            StoreError::NotFound { code, .. } => code,
            StoreError::InvalidData(_) => "TOOL_EXECUTION_FAILED",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Sqlite(_) | StoreError::InvalidData(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
