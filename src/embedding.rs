//! The embedding backend collaborator: batched, concurrency-limited,
//! retrying calls to an external text→vector service.
//!
//! Generalizes the teacher's `OpenAIProvider`/`embed_openai` shape
//! (`model_name`/`dims` metadata pair, batched HTTP calls with
//! retry+backoff) into the `EmbeddingBackend` trait this core depends on,
//! plus a free `embed_chunks` helper that fans batches out in parallel
//! instead of the teacher's sequential loop.

use async_trait::async_trait;
use futures::stream::{FuturesOrdered, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{OnceCell, Semaphore};

use crate::error::CoreError;
use crate::http_retry::{send_with_retry, RetryPolicy};

/// Cached metadata about an embedding backend's model.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub model_id: String,
    pub dimension: usize,
    pub max_input_length: Option<usize>,
}

/// A text-embedding collaborator: text in, fixed-length float vectors out.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model metadata, cached by the backend after the first successful
    /// call (`spec.md` §4.2).
    async fn info(&self) -> Result<BackendInfo, CoreError>;

    /// Embed a single batch. Output length and order match `texts`.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;
}

/// Batching/fan-out knobs for [`embed_chunks`], matching `spec.md`
/// §4.2 `embedding.*` settings.
#[derive(Debug, Clone, Copy)]
pub struct EmbedChunksOptions {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
}

impl Default for EmbedChunksOptions {
    fn default() -> Self {
        Self {
            batch_size: 24,
            max_concurrent_batches: 4,
        }
    }
}

/// Embed `texts` via `backend`, splitting into batches of
/// `opts.batch_size`, running at most `opts.max_concurrent_batches` in
/// parallel, and reassembling in input order. On any batch failure the
/// remaining in-flight batches are dropped and the error propagates
/// without a partial result.
pub async fn embed_chunks(
    backend: &dyn EmbeddingBackend,
    texts: &[String],
    opts: &EmbedChunksOptions,
) -> Result<Vec<Vec<f32>>, CoreError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let semaphore = Semaphore::new(opts.max_concurrent_batches.max(1));
    let batches: Vec<&[String]> = texts.chunks(opts.batch_size.max(1)).collect();

    let mut in_flight = FuturesOrdered::new();
    for batch in &batches {
        let permit_fut = semaphore.acquire();
        in_flight.push_back(async move {
            let _permit = permit_fut.await.expect("semaphore never closed");
            backend.embed_batch(batch).await
        });
    }

    let mut ordered_results = Vec::with_capacity(batches.len());
    while let Some(result) = in_flight.next().await {
        ordered_results.push(result?);
    }

    let mut flattened = Vec::with_capacity(texts.len());
    for batch_result in ordered_results {
        flattened.extend(batch_result);
    }
    Ok(flattened)
}

/// HTTP `/info` response shape. The model dimension is nested under
/// either an `embedding` or `Embedding` key, per `spec.md` §6.
#[derive(Debug, Deserialize)]
struct InfoResponse {
    model_id: String,
    model_type: ModelType,
    max_input_length: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ModelType {
    #[serde(rename = "embedding")]
    embedding_lower: Option<ModelDim>,
    #[serde(rename = "Embedding")]
    embedding_upper: Option<ModelDim>,
}

#[derive(Debug, Deserialize)]
struct ModelDim {
    dim: usize,
}

/// `EmbeddingBackend` implementation against an HTTP service exposing
/// `GET /info` and `POST /embed`, per `spec.md` §6.
pub struct HttpEmbeddingBackend {
    base_url: String,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
    info_cache: OnceCell<BackendInfo>,
}

impl HttpEmbeddingBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_retry_policy(base_url, RetryPolicy::default())
    }

    pub fn with_retry_policy(base_url: impl Into<String>, retry_policy: RetryPolicy) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            retry_policy,
            info_cache: OnceCell::new(),
        }
    }

    async fn fetch_info(&self) -> Result<BackendInfo, CoreError> {
        let url = format!("{}/info", self.base_url);
        let response = send_with_retry(&self.retry_policy, || self.client.get(&url)).await?;
        let parsed: InfoResponse = response
            .json()
            .await
            .map_err(|e| CoreError::InvalidInput(format!("malformed /info response: {e}")))?;

        let dimension = parsed
            .model_type
            .embedding_lower
            .or(parsed.model_type.embedding_upper)
            .map(|m| m.dim)
            .ok_or_else(|| {
                CoreError::InvalidInput("/info response missing model_type.embedding.dim".into())
            })?;

        Ok(BackendInfo {
            model_id: parsed.model_id,
            dimension,
            max_input_length: parsed.max_input_length,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn info(&self) -> Result<BackendInfo, CoreError> {
        self.info_cache
            .get_or_try_init(|| self.fetch_info())
            .await
            .cloned()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        let url = format!("{}/embed", self.base_url);
        let body = json!({ "inputs": texts });
        let response =
            send_with_retry(&self.retry_policy, || self.client.post(&url).json(&body)).await?;

        let vectors: Vec<Vec<f32>> = response
            .json()
            .await
            .map_err(|e| CoreError::InvalidInput(format!("malformed /embed response: {e}")))?;

        if vectors.len() != texts.len() {
            return Err(CoreError::InvalidInput(format!(
                "embed response length {} does not match input length {}",
                vectors.len(),
                texts.len()
            )));
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubBackend {
        dimension: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EmbeddingBackend for StubBackend {
        async fn info(&self) -> Result<BackendInfo, CoreError> {
            Ok(BackendInfo {
                model_id: "stub".into(),
                dimension: self.dimension,
                max_input_length: None,
            })
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32; self.dimension])
                .collect())
        }
    }

    #[tokio::test]
    async fn embed_chunks_preserves_order_across_batches() {
        let backend = StubBackend {
            dimension: 2,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let texts: Vec<String> = (0..10).map(|i| "x".repeat(i + 1)).collect();
        let opts = EmbedChunksOptions {
            batch_size: 3,
            max_concurrent_batches: 2,
        };
        let vectors = embed_chunks(&backend, &texts, &opts).await.unwrap();
        assert_eq!(vectors.len(), texts.len());
        for (text, vector) in texts.iter().zip(vectors.iter()) {
            assert_eq!(vector[0], text.len() as f32);
        }
    }

    #[tokio::test]
    async fn embed_chunks_on_empty_input_makes_no_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = StubBackend {
            dimension: 2,
            calls: calls.clone(),
        };
        let vectors = embed_chunks(&backend, &[], &EmbedChunksOptions::default())
            .await
            .unwrap();
        assert!(vectors.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct FailingBackend;

    #[async_trait]
    impl EmbeddingBackend for FailingBackend {
        async fn info(&self) -> Result<BackendInfo, CoreError> {
            unreachable!()
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            Err(CoreError::BackendUnavailable {
                status: Some(500),
                message: "boom".into(),
            })
        }
    }

    #[tokio::test]
    async fn embed_chunks_propagates_batch_failure() {
        let texts: Vec<String> = (0..5).map(|i| format!("text-{i}")).collect();
        let result = embed_chunks(&FailingBackend, &texts, &EmbedChunksOptions::default()).await;
        assert!(result.is_err());
    }
}
