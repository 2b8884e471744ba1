//! Session & Compaction Machine: per-agent sessions, append-only event
//! logs, write-ahead compaction checkpoints, snapshot artifacts, and the
//! inactivity-driven compaction worker.
//!
//! Owns its own tables exclusively but writes compaction checkpoints
//! through `mem_core::Store` (§3 ownership note).

pub mod compaction;
pub mod error;
pub mod model;
pub mod schema;
pub mod session;

pub use compaction::{
    Compactor, InactivityWorkerOptions, InactivityWorkerResult, WriteAheadOptions,
    WriteAheadResult, build_checkpoint_content, run_inactivity_compaction_worker,
};
pub use error::{Result, SessionError};
pub use model::{
    CompactionEvent, CompactionTrigger, EventKind, EventRole, Session, SessionEvent, SessionScope,
    SessionSnapshot, SessionStatus, SessionStatusSummary, SourceTrigger, normalize_slug,
};
pub use session::{
    CheckpointOptions, CreateSnapshotOptions, EndSessionOptions, ListEventsOptions, SessionStore,
    StartSessionOptions,
};
