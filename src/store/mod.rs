//! The vector store collaborator: typed operations on an external vector
//! database, grounded on `context-harness-core::store::Store`'s shape
//! (`async_trait`, `Result<_, CoreError>`, one method per operation, no
//! leakage of the transport type into the trait). Two implementations
//! live alongside this trait: [`qdrant::QdrantVectorStore`] (HTTP,
//! production) and [`memory::InMemoryVectorStore`] (test fixture,
//! generalizing `context-harness-core::store::memory::InMemoryStore`).

pub mod memory;
pub mod qdrant;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{PayloadView, SourceCommand, VectorPoint};

/// Payload equality constraints passed to `query_points`/`scroll_by_url`
/// and friends. `spec.md` §4.3: "a mapping of payload equality
/// constraints".
pub type PayloadFilter = HashMap<String, Value>;

/// One hit from `query_points`, ordered by descending score.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: PayloadView,
}

/// One row from `scroll_by_url`. Unordered.
#[derive(Debug, Clone)]
pub struct ScrolledPoint {
    pub id: Uuid,
    pub payload: PayloadView,
}

/// Collection metadata returned by `get_collection_info`.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub status: String,
    pub points_count: u64,
    pub dimension: usize,
    pub distance: String,
    pub segments_count: u64,
}

/// Typed operations on the vector database. All ops propagate
/// `CoreError::BackendUnavailable` (service 5xx/429 beyond retry budget)
/// or a transport-wrapped variant of the same; `DimensionMismatch` from
/// `ensure_collection` is never retried.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create `name` with cosine distance if absent. Idempotent. If the
    /// collection exists with a different vector size, fails with
    /// `DimensionMismatch` (fatal; requires operator action).
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), CoreError>;

    /// Insert or replace `points` by id. Callers send batches of ≤ 100.
    async fn upsert_points(&self, name: &str, points: &[VectorPoint]) -> Result<(), CoreError>;

    /// Remove every point whose `payload.url == url`. Pre-image of a
    /// re-embed.
    async fn delete_by_url(&self, name: &str, url: &str) -> Result<(), CoreError>;

    /// Scoped delete: only points matching both `url` and
    /// `source_command`. Used by reconciliation so a hard sync never
    /// deletes e.g. scrape-origin docs at a crawl-origin URL.
    async fn delete_by_url_and_source_command(
        &self,
        name: &str,
        url: &str,
        source_command: SourceCommand,
    ) -> Result<(), CoreError>;

    /// Bulk delete every point whose `payload.domain == domain`.
    /// Operator tool.
    async fn delete_by_domain(&self, name: &str, domain: &str) -> Result<(), CoreError>;

    /// Top-`k` nearest neighbors to `vector`, optionally constrained by
    /// `filter`. Ordered by descending score.
    async fn query_points(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, CoreError>;

    /// All points with `payload.url == url`, unordered.
    async fn scroll_by_url(&self, name: &str, url: &str) -> Result<Vec<ScrolledPoint>, CoreError>;

    async fn count_by_url(&self, name: &str, url: &str) -> Result<u64, CoreError>;
    async fn count_by_domain(&self, name: &str, domain: &str) -> Result<u64, CoreError>;
    async fn count_points(&self, name: &str) -> Result<u64, CoreError>;

    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo, CoreError>;
}
