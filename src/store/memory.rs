//! In-memory `VectorStore` test double.
//!
//! Directly generalizes `context-harness-core::store::memory::InMemoryStore`'s
//! structure (one `RwLock` per logical table, brute-force cosine scan for
//! search) to the point/payload shape this core defines. Every other
//! component's test suite is built against this rather than a mocked
//! `VectorStore`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{PayloadView, SourceCommand, VectorPoint};

use super::{CollectionInfo, PayloadFilter, ScoredPoint, ScrolledPoint, VectorStore};

struct StoredPoint {
    vector: Vec<f32>,
    payload: Value,
}

struct CollectionData {
    dim: usize,
    points: HashMap<Uuid, StoredPoint>,
}

/// An in-memory `VectorStore`. Cheap, deterministic, and forgiving about
/// collection pre-creation (a production caller must still call
/// `ensure_collection`, but this fixture auto-creates on first upsert
/// for test convenience).
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, CollectionData>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

fn payload_matches(payload: &Value, key: &str, expected: &Value) -> bool {
    payload.get(key).map(|v| v == expected).unwrap_or(false)
}

fn payload_matches_filter(payload: &Value, filter: &PayloadFilter) -> bool {
    filter
        .iter()
        .all(|(key, value)| payload_matches(payload, key, value))
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), CoreError> {
        let mut collections = self.collections.write().unwrap();
        match collections.get(name) {
            Some(existing) if existing.dim != dim => Err(CoreError::DimensionMismatch {
                expected: existing.dim,
                actual: dim,
            }),
            Some(_) => Ok(()),
            None => {
                collections.insert(
                    name.to_string(),
                    CollectionData {
                        dim,
                        points: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn upsert_points(&self, name: &str, points: &[VectorPoint]) -> Result<(), CoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let mut collections = self.collections.write().unwrap();
        let collection = collections
            .entry(name.to_string())
            .or_insert_with(|| CollectionData {
                dim: points[0].vector.len(),
                points: HashMap::new(),
            });

        for point in points {
            if point.vector.len() != collection.dim {
                return Err(CoreError::DimensionMismatch {
                    expected: collection.dim,
                    actual: point.vector.len(),
                });
            }
            let payload = serde_json::to_value(&point.payload)
                .map_err(|e| CoreError::InvalidInput(format!("unserializable payload: {e}")))?;
            collection.points.insert(
                point.id,
                StoredPoint {
                    vector: point.vector.clone(),
                    payload,
                },
            );
        }
        Ok(())
    }

    async fn delete_by_url(&self, name: &str, url: &str) -> Result<(), CoreError> {
        let mut collections = self.collections.write().unwrap();
        if let Some(collection) = collections.get_mut(name) {
            let url_value = Value::String(url.to_string());
            collection
                .points
                .retain(|_, p| !payload_matches(&p.payload, "url", &url_value));
        }
        Ok(())
    }

    async fn delete_by_url_and_source_command(
        &self,
        name: &str,
        url: &str,
        source_command: SourceCommand,
    ) -> Result<(), CoreError> {
        let mut collections = self.collections.write().unwrap();
        if let Some(collection) = collections.get_mut(name) {
            let url_value = Value::String(url.to_string());
            let cmd_value = serde_json::to_value(source_command).unwrap();
            collection.points.retain(|_, p| {
                !(payload_matches(&p.payload, "url", &url_value)
                    && payload_matches(&p.payload, "source_command", &cmd_value))
            });
        }
        Ok(())
    }

    async fn delete_by_domain(&self, name: &str, domain: &str) -> Result<(), CoreError> {
        let mut collections = self.collections.write().unwrap();
        if let Some(collection) = collections.get_mut(name) {
            let domain_value = Value::String(domain.to_string());
            collection
                .points
                .retain(|_, p| !payload_matches(&p.payload, "domain", &domain_value));
        }
        Ok(())
    }

    async fn query_points(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, CoreError> {
        let collections = self.collections.read().unwrap();
        let Some(collection) = collections.get(name) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredPoint> = collection
            .points
            .iter()
            .filter(|(_, p)| filter.map(|f| payload_matches_filter(&p.payload, f)).unwrap_or(true))
            .map(|(id, p)| ScoredPoint {
                id: *id,
                score: cosine_sim(vector, &p.vector),
                payload: PayloadView::new(p.payload.clone()),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn scroll_by_url(&self, name: &str, url: &str) -> Result<Vec<ScrolledPoint>, CoreError> {
        let collections = self.collections.read().unwrap();
        let Some(collection) = collections.get(name) else {
            return Ok(Vec::new());
        };
        let url_value = Value::String(url.to_string());
        Ok(collection
            .points
            .iter()
            .filter(|(_, p)| payload_matches(&p.payload, "url", &url_value))
            .map(|(id, p)| ScrolledPoint {
                id: *id,
                payload: PayloadView::new(p.payload.clone()),
            })
            .collect())
    }

    async fn count_by_url(&self, name: &str, url: &str) -> Result<u64, CoreError> {
        Ok(self.scroll_by_url(name, url).await?.len() as u64)
    }

    async fn count_by_domain(&self, name: &str, domain: &str) -> Result<u64, CoreError> {
        let collections = self.collections.read().unwrap();
        let Some(collection) = collections.get(name) else {
            return Ok(0);
        };
        let domain_value = Value::String(domain.to_string());
        Ok(collection
            .points
            .values()
            .filter(|p| payload_matches(&p.payload, "domain", &domain_value))
            .count() as u64)
    }

    async fn count_points(&self, name: &str) -> Result<u64, CoreError> {
        let collections = self.collections.read().unwrap();
        Ok(collections.get(name).map(|c| c.points.len()).unwrap_or(0) as u64)
    }

    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo, CoreError> {
        let collections = self.collections.read().unwrap();
        let collection = collections
            .get(name)
            .ok_or_else(|| CoreError::InvalidInput(format!("no such collection: {name}")))?;
        Ok(CollectionInfo {
            status: "green".to_string(),
            points_count: collection.points.len() as u64,
            dimension: collection.dim,
            distance: "Cosine".to_string(),
            segments_count: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentType, SourceCommand as SC, SourceType, VectorPayload};
    use crate::source_id::SourceId;
    use chrono::Utc;

    fn make_point(url: &str, chunk_index: usize, vector: Vec<f32>) -> VectorPoint {
        let source = SourceId::from_url(url);
        VectorPoint {
            id: VectorPoint::deterministic_id(&source, chunk_index),
            vector,
            payload: VectorPayload {
                url: url.to_string(),
                title: None,
                domain: "x.test".to_string(),
                source_command: SC::Scrape,
                source_type: SourceType::Url,
                content_type: ContentType::Markdown,
                chunk_index,
                total_chunks: 1,
                chunk_header: None,
                chunk_text: "hello".to_string(),
                file_info: None,
                scraped_at: Utc::now(),
                ingest_id: None,
                ingest_root: None,
            },
        }
    }

    #[tokio::test]
    async fn ensure_collection_rejects_mismatched_dimension() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 3).await.unwrap();
        let err = store.ensure_collection("c", 4).await.unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn upsert_then_query_returns_nearest_neighbor_first() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        let a = make_point("https://a.test", 0, vec![1.0, 0.0]);
        let b = make_point("https://b.test", 0, vec![0.0, 1.0]);
        store.upsert_points("c", &[a, b]).await.unwrap();

        let results = store.query_points("c", &[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].payload.get_string("url").unwrap(), "https://a.test");
    }

    #[tokio::test]
    async fn delete_by_url_removes_only_matching_points() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        let a = make_point("https://a.test", 0, vec![1.0, 0.0]);
        let b = make_point("https://b.test", 0, vec![0.0, 1.0]);
        store.upsert_points("c", &[a, b]).await.unwrap();

        store.delete_by_url("c", "https://a.test").await.unwrap();
        assert_eq!(store.count_points("c").await.unwrap(), 1);
        assert_eq!(store.count_by_url("c", "https://a.test").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_upsert_of_same_point_overwrites_not_duplicates() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        let a1 = make_point("https://a.test", 0, vec![1.0, 0.0]);
        let a2 = make_point("https://a.test", 0, vec![0.5, 0.5]);
        store.upsert_points("c", &[a1]).await.unwrap();
        store.upsert_points("c", &[a2]).await.unwrap();
        assert_eq!(store.count_points("c").await.unwrap(), 1);
    }
}
