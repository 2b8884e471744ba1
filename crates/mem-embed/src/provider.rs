//! Embedding provider trait boundary (SPEC_FULL.md "Supplemented features").
//!
//! §6 describes the Provider API contract (`POST {model, input} -> {data:
//! [{embedding}], model}`) but not its Rust shape. `EmbeddingProvider` is the
//! seam the queue processor (§4.4) calls through, so it's testable with a
//! mock without a real network call — the same abstraction `at-core`/
//! `at-agents` use in the pack for their own external model calls.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::model::EmbeddingResult;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, model: &str, input: &str) -> Result<EmbeddingResult, ProviderError>;
}

/// `reqwest`-backed provider against `AI_GATEWAY_BASE_URL` (§6).
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), api_key: api_key.into() }
    }
}

#[derive(serde::Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(serde::Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
    model: String,
}

#[derive(serde::Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, model: &str, input: &str) -> Result<EmbeddingResult, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbedRequest { model, input })
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ProviderError::ServerError { status: status.as_u16() });
        }
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::ClientError { status: status.as_u16(), message: body });
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let first = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("empty data array".to_string()))?;

        Ok(EmbeddingResult { model: parsed.model, vector: first.embedding })
    }
}

/// Deterministic offline fallback used when no `AI_GATEWAY_*` credentials
/// are configured (§6 lists the provider as injected, not mandatory). Hashes
/// the input into a small fixed-dimension vector so the rest of the
/// embedding pipeline (storage, backfill, observability) has something real
/// to exercise without a network call.
pub struct LocalHashEmbeddingProvider {
    dimension: usize,
}

impl LocalHashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1) }
    }
}

impl Default for LocalHashEmbeddingProvider {
    fn default() -> Self {
        Self::new(32)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalHashEmbeddingProvider {
    async fn embed(&self, model: &str, input: &str) -> Result<EmbeddingResult, ProviderError> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut vector = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let mut hasher = DefaultHasher::new();
            input.hash(&mut hasher);
            i.hash(&mut hasher);
            let bits = hasher.finish();
            vector.push(((bits % 2001) as f32 / 1000.0) - 1.0);
        }
        Ok(EmbeddingResult { model: model.to_string(), vector })
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted provider for queue-processing tests: returns the next entry
    /// in `responses` on each call, cycling `Err` variants for retry/
    /// dead-letter scenarios.
    pub struct ScriptedProvider {
        responses: Mutex<Vec<Result<Vec<f32>, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn new(responses: Vec<Result<Vec<f32>, ProviderError>>) -> Self {
            Self { responses: Mutex::new(responses), calls: AtomicUsize::new(0) }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        async fn embed(&self, model: &str, _input: &str) -> Result<EmbeddingResult, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.responses.lock().unwrap();
            if guard.is_empty() {
                return Err(ProviderError::Network("no more scripted responses".to_string()));
            }
            let next = guard.remove(0);
            next.map(|vector| EmbeddingResult { model: model.to_string(), vector })
        }
    }
}
