//! Orchestrates chunk→embed→upsert for one document with idempotent
//! replace-by-source (`spec.md` §4.4).
//!
//! The collection-readiness cache deliberately avoids a
//! `tokio::sync::OnceCell`-style guard: a `OnceCell` cannot be cleared,
//! which would let a single failed `ensure_collection` call poison every
//! later call forever (the "cached-rejection trap" in `spec.md` §9). A
//! plain set of confirmed-ready names, populated only on success, gets
//! the same one-time-setup behavior without that footgun.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::chunk::{self, ChunkOptions};
use crate::embedding::{embed_chunks, EmbedChunksOptions, EmbeddingBackend};
use crate::error::CoreError;
use crate::models::{ContentType, FileInfo, SourceCommand, VectorPayload, VectorPoint};
use crate::source_id::SourceId;
use crate::store::VectorStore;

/// The magic "generic web collection" name `spec.md` §4.4 step 1
/// compares against when deciding whether to reroute file/stdin sources
/// to the repo collection.
const GENERIC_WEB_COLLECTION: &str = "web";

/// Caller-supplied metadata for one document, `spec.md` §4.4.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub url: SourceId,
    pub title: Option<String>,
    pub source_command: SourceCommand,
    pub content_type: ContentType,
    pub collection: Option<String>,
    pub file_info: Option<FileInfo>,
    pub ingest_id: Option<String>,
    pub ingest_root: Option<String>,
    pub hard_sync: bool,
    pub no_chunk: bool,
}

impl DocumentMeta {
    pub fn new(url: SourceId, source_command: SourceCommand, content_type: ContentType) -> Self {
        Self {
            url,
            title: None,
            source_command,
            content_type,
            collection: None,
            file_info: None,
            ingest_id: None,
            ingest_root: None,
            hard_sync: false,
            no_chunk: false,
        }
    }
}

/// Outcome of a successful `auto_embed`/`batch_embed` item.
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    pub collection: String,
    pub chunk_count: usize,
}

/// Tuning knobs threaded through to the chunker and the embedding fan-out.
#[derive(Debug, Clone)]
pub struct EmbedPipelineOptions {
    pub default_collection: String,
    pub repo_collection: String,
    pub chunk_options: ChunkOptions,
    pub embed_chunks_options: EmbedChunksOptions,
    pub upsert_batch_size: usize,
}

impl Default for EmbedPipelineOptions {
    fn default() -> Self {
        Self {
            default_collection: GENERIC_WEB_COLLECTION.to_string(),
            repo_collection: "repos".to_string(),
            chunk_options: ChunkOptions::default(),
            embed_chunks_options: EmbedChunksOptions::default(),
            upsert_batch_size: 100,
        }
    }
}

pub struct EmbedPipeline<E: EmbeddingBackend, V: VectorStore> {
    embedding: Arc<E>,
    store: Arc<V>,
    options: EmbedPipelineOptions,
    ready_collections: Mutex<HashSet<String>>,
}

impl<E: EmbeddingBackend, V: VectorStore> EmbedPipeline<E, V> {
    pub fn new(embedding: Arc<E>, store: Arc<V>, options: EmbedPipelineOptions) -> Self {
        Self {
            embedding,
            store,
            options,
            ready_collections: Mutex::new(HashSet::new()),
        }
    }

    fn resolve_collection(&self, meta: &DocumentMeta) -> String {
        if let Some(collection) = &meta.collection {
            return collection.clone();
        }
        let is_local = matches!(meta.url, SourceId::File(_) | SourceId::Stdin(_));
        if is_local && self.options.default_collection == GENERIC_WEB_COLLECTION {
            return self.options.repo_collection.clone();
        }
        self.options.default_collection.clone()
    }

    /// Ensure `collection` exists with the right vector size. Never caches
    /// a failure: on error the name is simply not added to the ready set,
    /// so the very next call re-attempts `ensure_collection` instead of
    /// replaying a stale rejection.
    async fn ensure_ready(&self, collection: &str, dim: usize) -> Result<(), CoreError> {
        {
            let ready = self.ready_collections.lock().await;
            if ready.contains(collection) {
                return Ok(());
            }
        }
        self.store.ensure_collection(collection, dim).await?;
        self.ready_collections
            .lock()
            .await
            .insert(collection.to_string());
        Ok(())
    }

    fn derive_domain(&self, url: &SourceId) -> String {
        match url {
            SourceId::Url(u) => url::Url::parse(u)
                .ok()
                .and_then(|parsed| parsed.host_str().map(|h| h.to_string()))
                .unwrap_or_else(|| u.clone()),
            SourceId::File(p) | SourceId::Stdin(p) => {
                p.split('/').next().unwrap_or(p).to_string()
            }
        }
    }

    /// Embed `content` under `meta.url`, replacing any older chunks for
    /// that source. After success the vector store contains exactly the
    /// chunks derived from `content`, nothing older.
    pub async fn auto_embed(
        &self,
        content: &str,
        meta: &DocumentMeta,
    ) -> Result<EmbedOutcome, CoreError> {
        let collection = self.resolve_collection(meta);

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidInput("empty content".to_string()));
        }

        let chunks = if meta.no_chunk {
            vec![chunk::Chunk {
                index: 0,
                text: trimmed.to_string(),
                header: None,
                total_chunks: 1,
            }]
        } else {
            chunk::chunk(trimmed, &self.options.chunk_options)
        };

        let info = self.embedding.info().await?;
        self.ensure_ready(&collection, info.dimension).await?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_chunks(
            self.embedding.as_ref(),
            &texts,
            &self.options.embed_chunks_options,
        )
        .await?;

        if vectors.len() != chunks.len() {
            return Err(CoreError::InvalidInput(
                "embedding backend returned a mismatched vector count".to_string(),
            ));
        }

        let url_string = meta.url.to_string();
        let domain = self.derive_domain(&meta.url);
        let scraped_at = Utc::now();

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(vectors.into_iter())
            .map(|(c, vector)| VectorPoint {
                id: VectorPoint::deterministic_id(&meta.url, c.index),
                vector,
                payload: VectorPayload {
                    url: url_string.clone(),
                    title: meta.title.clone(),
                    domain: domain.clone(),
                    source_command: meta.source_command,
                    source_type: match meta.url {
                        SourceId::Url(_) => crate::models::SourceType::Url,
                        SourceId::File(_) => crate::models::SourceType::File,
                        SourceId::Stdin(_) => crate::models::SourceType::Stdin,
                    },
                    content_type: meta.content_type,
                    chunk_index: c.index,
                    total_chunks: c.total_chunks,
                    chunk_header: c.header.clone(),
                    chunk_text: c.text.clone(),
                    file_info: meta.file_info.clone(),
                    scraped_at,
                    ingest_id: meta.ingest_id.clone(),
                    ingest_root: meta.ingest_root.clone(),
                },
            })
            .collect();

        // Delete-before-upsert: strictly ordered so a failed upsert
        // leaves the store empty for this source rather than stale.
        if meta.hard_sync {
            self.store
                .delete_by_url_and_source_command(&collection, &url_string, meta.source_command)
                .await?;
        } else {
            self.store.delete_by_url(&collection, &url_string).await?;
        }

        for batch in points.chunks(self.options.upsert_batch_size.max(1)) {
            self.store.upsert_points(&collection, batch).await?;
        }

        Ok(EmbedOutcome {
            collection,
            chunk_count: points.len(),
        })
    }

    /// Embed several documents in sequence. Stops and propagates on the
    /// first failure rather than partially reporting success for items
    /// not yet attempted.
    pub async fn batch_embed(
        &self,
        items: &[(String, DocumentMeta)],
    ) -> Result<Vec<EmbedOutcome>, CoreError> {
        let mut outcomes = Vec::with_capacity(items.len());
        for (content, meta) in items {
            outcomes.push(self.auto_embed(content, meta).await?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::BackendInfo;
    use crate::store::memory::InMemoryVectorStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubBackend {
        dim: usize,
    }

    #[async_trait]
    impl EmbeddingBackend for StubBackend {
        async fn info(&self) -> Result<BackendInfo, CoreError> {
            Ok(BackendInfo {
                model_id: "stub".into(),
                dimension: self.dim,
                max_input_length: None,
            })
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32; self.dim]).collect())
        }
    }

    struct FlakyStore {
        inner: InMemoryVectorStore,
        fail_next_ensure: Arc<std::sync::atomic::AtomicBool>,
        ensure_calls: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
        async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), CoreError> {
            self.ensure_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next_ensure.swap(false, Ordering::SeqCst) {
                return Err(CoreError::Transient("simulated failure".into()));
            }
            self.inner.ensure_collection(name, dim).await
        }
        async fn upsert_points(
            &self,
            name: &str,
            points: &[VectorPoint],
        ) -> Result<(), CoreError> {
            self.inner.upsert_points(name, points).await
        }
        async fn delete_by_url(&self, name: &str, url: &str) -> Result<(), CoreError> {
            self.inner.delete_by_url(name, url).await
        }
        async fn delete_by_url_and_source_command(
            &self,
            name: &str,
            url: &str,
            source_command: SourceCommand,
        ) -> Result<(), CoreError> {
            self.inner
                .delete_by_url_and_source_command(name, url, source_command)
                .await
        }
        async fn delete_by_domain(&self, name: &str, domain: &str) -> Result<(), CoreError> {
            self.inner.delete_by_domain(name, domain).await
        }
        async fn query_points(
            &self,
            name: &str,
            vector: &[f32],
            k: usize,
            filter: Option<&crate::store::PayloadFilter>,
        ) -> Result<Vec<crate::store::ScoredPoint>, CoreError> {
            self.inner.query_points(name, vector, k, filter).await
        }
        async fn scroll_by_url(
            &self,
            name: &str,
            url: &str,
        ) -> Result<Vec<crate::store::ScrolledPoint>, CoreError> {
            self.inner.scroll_by_url(name, url).await
        }
        async fn count_by_url(&self, name: &str, url: &str) -> Result<u64, CoreError> {
            self.inner.count_by_url(name, url).await
        }
        async fn count_by_domain(&self, name: &str, domain: &str) -> Result<u64, CoreError> {
            self.inner.count_by_domain(name, domain).await
        }
        async fn count_points(&self, name: &str) -> Result<u64, CoreError> {
            self.inner.count_points(name).await
        }
        async fn get_collection_info(
            &self,
            name: &str,
        ) -> Result<crate::store::CollectionInfo, CoreError> {
            self.inner.get_collection_info(name).await
        }
    }

    fn meta(url: &str) -> DocumentMeta {
        let mut m = DocumentMeta::new(
            SourceId::from_url(url),
            SourceCommand::Scrape,
            ContentType::Markdown,
        );
        m.collection = Some("axon".to_string());
        m
    }

    #[tokio::test]
    async fn auto_embed_rejects_empty_content() {
        let backend = Arc::new(StubBackend { dim: 3 });
        let store = Arc::new(InMemoryVectorStore::new());
        let pipeline = EmbedPipeline::new(backend, store, EmbedPipelineOptions::default());

        let err = pipeline
            .auto_embed("   ", &meta("https://x.test"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn auto_embed_is_idempotent_same_ids_on_rerun() {
        let backend = Arc::new(StubBackend { dim: 3 });
        let store = Arc::new(InMemoryVectorStore::new());
        let pipeline = EmbedPipeline::new(backend, store.clone(), EmbedPipelineOptions::default());

        let m = meta("https://x.test");
        pipeline.auto_embed("# H\n\nHello world", &m).await.unwrap();
        let before = store.count_by_url("axon", "https://x.test").await.unwrap();
        pipeline.auto_embed("# H\n\nHello world", &m).await.unwrap();
        let after = store.count_by_url("axon", "https://x.test").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn collection_init_failure_does_not_poison_future_calls() {
        let backend = Arc::new(StubBackend { dim: 3 });
        let flaky = Arc::new(FlakyStore {
            inner: InMemoryVectorStore::new(),
            fail_next_ensure: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            ensure_calls: AtomicUsize::new(0),
        });
        let pipeline = EmbedPipeline::new(backend, flaky.clone(), EmbedPipelineOptions::default());

        let m = meta("https://x.test");
        let first = pipeline.auto_embed("hello world content", &m).await;
        assert!(first.is_err());

        let second = pipeline.auto_embed("hello world content", &m).await;
        assert!(second.is_ok());
        assert_eq!(flaky.ensure_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn file_source_without_explicit_collection_routes_to_repo_collection() {
        let backend = Arc::new(StubBackend { dim: 3 });
        let store = Arc::new(InMemoryVectorStore::new());
        let mut opts = EmbedPipelineOptions::default();
        opts.default_collection = "web".to_string();
        opts.repo_collection = "repos".to_string();
        let pipeline = EmbedPipeline::new(backend, store.clone(), opts);

        let mut m = DocumentMeta::new(
            SourceId::File("repoA/docs/x.md".to_string()),
            SourceCommand::Embed,
            ContentType::Markdown,
        );
        m.collection = None;
        let outcome = pipeline.auto_embed("file content here", &m).await.unwrap();
        assert_eq!(outcome.collection, "repos");
    }
}
