//! Row shapes for the embedding job queue, backfill state, and metrics
//! (§3, §4.4–§4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// §3 "MemoryEmbeddingJob ... States: {queued, processing, succeeded, dead_letter}".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Succeeded,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => JobStatus::Processing,
            "succeeded" => JobStatus::Succeeded,
            "dead_letter" => JobStatus::DeadLetter,
            _ => JobStatus::Queued,
        }
    }
}

/// §4.4 "Enqueue(...) operation" — the triggering write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOperation {
    Add,
    Edit,
    Backfill,
}

impl JobOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOperation::Add => "add",
            JobOperation::Edit => "edit",
            JobOperation::Backfill => "backfill",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub id: i64,
    pub memory_id: String,
    pub model: String,
    pub model_version: Option<String>,
    pub operation: JobOperation,
    pub status: JobStatus,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// §4.4 terminal-step metric outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Retry,
    DeadLetter,
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Retry => "retry",
            JobOutcome::DeadLetter => "dead_letter",
            JobOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobMetric {
    pub job_id: i64,
    pub memory_id: String,
    pub model: String,
    pub outcome: JobOutcome,
    pub duration_ms: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempt: i64,
    pub created_at: DateTime<Utc>,
}

/// §3 "MemoryEmbedding — one row per memory per model".
#[derive(Debug, Clone)]
pub struct MemoryEmbedding {
    pub memory_id: String,
    pub model: String,
    pub model_version: Option<String>,
    pub dimension: usize,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw little-endian float32 blob encode/decode (§6, §9 "Float32 blob").
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// §3 "MemoryEmbeddingBackfillState ... status ∈ {idle, running, paused, completed}".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Idle,
    Running,
    Paused,
    Completed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Idle => "idle",
            BackfillStatus::Running => "running",
            BackfillStatus::Paused => "paused",
            BackfillStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => BackfillStatus::Running,
            "paused" => BackfillStatus::Paused,
            "completed" => BackfillStatus::Completed,
            _ => BackfillStatus::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackfillState {
    pub model: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub status: BackfillStatus,
    pub checkpoint_created_at: Option<DateTime<Utc>>,
    pub checkpoint_memory_id: Option<String>,
    pub scanned_count: i64,
    pub enqueued_count: i64,
    pub estimated_total: i64,
    pub estimated_remaining: i64,
    pub batch_limit: i64,
    pub throttle_ms: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Scope key per §4.5: `"${modelId}|${projectId??'*'}|${userId??'*'}"`.
pub fn scope_key(model: &str, project_id: Option<&str>, user_id: Option<&str>) -> String {
    format!("{}|{}|{}", model, project_id.unwrap_or("*"), user_id.unwrap_or("*"))
}

/// Result of a successful provider embed call (§6 "Provider API").
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub model: String,
    pub vector: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_blob_roundtrips() {
        let vector = vec![0.1_f32, -2.5, 3.0, f32::MAX, f32::MIN];
        let bytes = encode_embedding(&vector);
        assert_eq!(bytes.len(), vector.len() * 4);
        let decoded = decode_embedding(&bytes);
        assert_eq!(decoded, vector);
    }

    #[test]
    fn scope_key_uses_wildcards_for_absent_dims() {
        assert_eq!(scope_key("text-embedding-3", None, None), "text-embedding-3|*|*");
        assert_eq!(scope_key("text-embedding-3", Some("proj-1"), None), "text-embedding-3|proj-1|*");
    }
}
