//! Embedding Subsystem: durable job queue (C4), checkpointed backfill (C5),
//! and observability/alarms (C6) layered over `mem-core`'s memory store.
//!
//! Owns its own tables exclusively; never touches `memories` rows directly
//! except through `mem_core::Store`'s read paths.

pub mod backfill;
pub mod error;
pub mod model;
pub mod observability;
pub mod provider;
pub mod queue;
pub mod schema;

pub use backfill::{Backfill, BackfillScope, RunBatchResult};
pub use error::{EmbeddingError, ProviderError, Result};
pub use model::{
    BackfillState, BackfillStatus, EmbeddingJob, EmbeddingResult, JobMetric, JobOperation,
    JobOutcome, JobStatus, MemoryEmbedding, decode_embedding, encode_embedding, scope_key,
};
pub use observability::{
    Alarm, AlarmLevel, CostScope, CostSummary, NoUsageLoader, Observability, OverallHealth,
    RetrievalRecord, Snapshot, SnapshotScope, UsageLoader, record_retrieval,
};
pub use provider::{EmbeddingProvider, HttpEmbeddingProvider, LocalHashEmbeddingProvider};
pub use queue::{EmbeddingQueue, EnqueueOutcome, MemoryLookup, RetryPolicy, StoreMemoryLookup};
