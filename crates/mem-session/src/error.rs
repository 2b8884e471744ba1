use thiserror::Error;

/// Domain error for the session & compaction machine (§4.7). Wraps
/// `mem_core::StoreError` for the write-ahead checkpoint path, which goes
/// through the Memory Store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] mem_core::StoreError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("cannot {action} session {session_id} because it is {status}")]
    InvalidState { session_id: String, status: String, action: String },

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
