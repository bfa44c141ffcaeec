//! HTTP `VectorStore` implementation against a Qdrant-shaped REST API
//! (`spec.md` §6). Plain `reqwest` JSON calls, no `qdrant-client` SDK —
//! the contract is deliberately minimal and typing the whole Qdrant API
//! would pull in far more than this core needs. The
//! `QdrantStorage`/`VectorStorage` naming convention already present in
//! the pack's `codetriever` worker corroborates this wire shape.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::CoreError;
use crate::http_retry::{send_with_retry, RetryPolicy};
use crate::models::{PayloadView, SourceCommand, VectorPoint};

use super::{CollectionInfo, PayloadFilter, ScoredPoint, ScrolledPoint, VectorStore};

pub struct QdrantVectorStore {
    base_url: String,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl QdrantVectorStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_retry_policy(base_url, RetryPolicy::default())
    }

    pub fn with_retry_policy(base_url: impl Into<String>, retry_policy: RetryPolicy) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            retry_policy,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_result(&self, response: reqwest::Response) -> Result<Value, CoreError> {
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| CoreError::InvalidInput(format!("malformed vector store response: {e}")))?;
        Ok(envelope.result)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    result: Value,
}

fn url_filter(url: &str) -> Value {
    json!({ "must": [{ "key": "url", "match": { "value": url } }] })
}

fn domain_filter(domain: &str) -> Value {
    json!({ "must": [{ "key": "domain", "match": { "value": domain } }] })
}

fn url_and_source_command_filter(url: &str, source_command: SourceCommand) -> Value {
    json!({
        "must": [
            { "key": "url", "match": { "value": url } },
            { "key": "source_command", "match": { "value": source_command_str(source_command) } },
        ]
    })
}

fn source_command_str(cmd: SourceCommand) -> &'static str {
    match cmd {
        SourceCommand::Scrape => "scrape",
        SourceCommand::Crawl => "crawl",
        SourceCommand::Search => "search",
        SourceCommand::Extract => "extract",
        SourceCommand::Embed => "embed",
    }
}

fn payload_filter_to_json(filter: &PayloadFilter) -> Value {
    let must: Vec<Value> = filter
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect();
    json!({ "must": must })
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), CoreError> {
        let url = self.url(&format!("/collections/{name}"));
        let body = json!({ "vectors": { "size": dim, "distance": "Cosine" } });
        let response = send_with_retry(&self.retry_policy, || {
            self.client.put(&url).json(&body)
        })
        .await;

        match response {
            Ok(_) => Ok(()),
            Err(CoreError::BackendUnavailable {
                status: Some(status),
                ..
            }) if (400..500).contains(&status) => {
                // Idempotent guard: collection likely already exists.
                // Verify the existing dimension matches.
                let info = self.get_collection_info(name).await?;
                if info.dimension != dim {
                    return Err(CoreError::DimensionMismatch {
                        expected: info.dimension,
                        actual: dim,
                    });
                }
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    async fn upsert_points(&self, name: &str, points: &[VectorPoint]) -> Result<(), CoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let url = self.url(&format!("/collections/{name}/points"));
        let body = json!({
            "points": points.iter().map(|p| json!({
                "id": p.id,
                "vector": p.vector,
                "payload": p.payload,
            })).collect::<Vec<_>>(),
        });
        send_with_retry(&self.retry_policy, || self.client.put(&url).json(&body)).await?;
        Ok(())
    }

    async fn delete_by_url(&self, name: &str, url: &str) -> Result<(), CoreError> {
        let endpoint = self.url(&format!("/collections/{name}/points/delete"));
        let body = json!({ "filter": url_filter(url) });
        send_with_retry(&self.retry_policy, || {
            self.client.post(&endpoint).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn delete_by_url_and_source_command(
        &self,
        name: &str,
        url: &str,
        source_command: SourceCommand,
    ) -> Result<(), CoreError> {
        let endpoint = self.url(&format!("/collections/{name}/points/delete"));
        let body = json!({ "filter": url_and_source_command_filter(url, source_command) });
        send_with_retry(&self.retry_policy, || {
            self.client.post(&endpoint).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn delete_by_domain(&self, name: &str, domain: &str) -> Result<(), CoreError> {
        let endpoint = self.url(&format!("/collections/{name}/points/delete"));
        let body = json!({ "filter": domain_filter(domain) });
        send_with_retry(&self.retry_policy, || {
            self.client.post(&endpoint).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn query_points(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, CoreError> {
        let endpoint = self.url(&format!("/collections/{name}/points/query"));
        let mut body = json!({ "vector": vector, "limit": k });
        if let Some(f) = filter {
            body["filter"] = payload_filter_to_json(f);
        }
        let response = send_with_retry(&self.retry_policy, || {
            self.client.post(&endpoint).json(&body)
        })
        .await?;
        let result = self.read_result(response).await?;

        let hits = result.as_array().cloned().unwrap_or_default();
        hits.into_iter()
            .map(|hit| {
                let id: Uuid = serde_json::from_value(hit["id"].clone())
                    .map_err(|e| CoreError::InvalidInput(format!("bad point id: {e}")))?;
                let score = hit["score"].as_f64().unwrap_or(0.0) as f32;
                let payload = PayloadView::new(hit["payload"].clone());
                Ok(ScoredPoint { id, score, payload })
            })
            .collect()
    }

    async fn scroll_by_url(&self, name: &str, url: &str) -> Result<Vec<ScrolledPoint>, CoreError> {
        let endpoint = self.url(&format!("/collections/{name}/points/scroll"));
        let mut all = Vec::new();
        let mut offset: Option<Value> = None;

        loop {
            let mut body = json!({ "filter": url_filter(url), "with_payload": true });
            if let Some(o) = &offset {
                body["offset"] = o.clone();
            }
            let response = send_with_retry(&self.retry_policy, || {
                self.client.post(&endpoint).json(&body)
            })
            .await?;
            let result = self.read_result(response).await?;

            let points = result["points"].as_array().cloned().unwrap_or_default();
            if points.is_empty() {
                break;
            }
            for point in points {
                let id: Uuid = serde_json::from_value(point["id"].clone())
                    .map_err(|e| CoreError::InvalidInput(format!("bad point id: {e}")))?;
                let payload = PayloadView::new(point["payload"].clone());
                all.push(ScrolledPoint { id, payload });
            }

            match result.get("next_page_offset").filter(|v| !v.is_null()) {
                Some(next) => offset = Some(next.clone()),
                None => break,
            }
        }

        Ok(all)
    }

    async fn count_by_url(&self, name: &str, url: &str) -> Result<u64, CoreError> {
        self.count_with_filter(name, Some(url_filter(url))).await
    }

    async fn count_by_domain(&self, name: &str, domain: &str) -> Result<u64, CoreError> {
        self.count_with_filter(name, Some(domain_filter(domain)))
            .await
    }

    async fn count_points(&self, name: &str) -> Result<u64, CoreError> {
        self.count_with_filter(name, None).await
    }

    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo, CoreError> {
        let endpoint = self.url(&format!("/collections/{name}"));
        let response = send_with_retry(&self.retry_policy, || self.client.get(&endpoint)).await?;
        let result = self.read_result(response).await?;

        let dimension = result["config"]["params"]["vectors"]["size"]
            .as_u64()
            .ok_or_else(|| CoreError::InvalidInput("missing vectors.size".into()))?
            as usize;
        let distance = result["config"]["params"]["vectors"]["distance"]
            .as_str()
            .unwrap_or("Cosine")
            .to_string();

        Ok(CollectionInfo {
            status: result["status"].as_str().unwrap_or("unknown").to_string(),
            points_count: result["points_count"].as_u64().unwrap_or(0),
            dimension,
            distance,
            segments_count: result["segments_count"].as_u64().unwrap_or(0),
        })
    }
}

impl QdrantVectorStore {
    async fn count_with_filter(&self, name: &str, filter: Option<Value>) -> Result<u64, CoreError> {
        let endpoint = self.url(&format!("/collections/{name}/points/count"));
        let body = match filter {
            Some(f) => json!({ "filter": f }),
            None => json!({}),
        };
        let response = send_with_retry(&self.retry_policy, || {
            self.client.post(&endpoint).json(&body)
        })
        .await?;
        let result = self.read_result(response).await?;
        Ok(result["count"].as_u64().unwrap_or(0))
    }
}
