//! Memory Store Engine: typed, layered, soft-deleted, scoped, history-tracked
//! storage of agent memories atop SQLite + FTS5.
//!
//! Zero network I/O — owns `rusqlite` and the `memories`/`memory_history`/
//! `memory_links` tables. Transport concerns (HTTP, JSON-RPC) live in
//! `mem-server`; this crate is the engine they drive.

pub mod consolidate;
pub mod envelope;
pub mod error;
pub mod id;
pub mod links;
pub mod model;
pub mod retrieval;
pub mod schema;
pub mod store;
pub mod stream;

pub use consolidate::{ConsolidateOptions, ConsolidateResult, Consolidator};
pub use envelope::{ApiErrorDetail, ErrorKind, ToolEnvelope};
pub use error::{Result, StoreError};
pub use model::{
    LinkType, Memory, MemoryHistory, MemoryLink, MemoryType, Layer, Scope, join_tokens,
    normalize_tokens, split_tokens,
};
pub use retrieval::{ContextMode, ContextOptions, ContextResult, Retriever, estimate_tokens};
pub use store::{
    AddOptions, ForgetFilter, ListOptions, RuleOptions, SearchOptions, SearchOutcome, Store,
    UpdateRequest, UpsertOutcome,
};
pub use stream::{StreamBuffer, StreamCapture, StreamOptions};
