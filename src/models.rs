//! Core data models shared across the ingestion and retrieval core.
//!
//! `VectorPoint`/`VectorPayload` are the unit the pipeline writes and the
//! query core reads back; `PayloadView` wraps the untyped JSON a vector
//! store actually returns on the read path, per the "dynamic typing →
//! typed records" design note.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::source_id::SourceId;

/// `source_command` tag carried on every `VectorPayload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceCommand {
    Scrape,
    Crawl,
    Search,
    Extract,
    Embed,
}

/// `source_type` tag, mirroring which `SourceId` variant produced this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Url,
    File,
    Stdin,
}

/// `content_type` tag describing the shape of the original content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Markdown,
    Html,
    Text,
}

/// Per-file metadata attached to a `VectorPayload` when the source is a
/// local file. Absent for `url`/`stdin` sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub source_path_rel: String,
    pub file_name: String,
    pub file_ext: Option<String>,
    pub file_size_bytes: u64,
    pub file_modified_at: DateTime<Utc>,
}

/// The payload stored alongside each vector. Field names match `spec.md`
/// §3 exactly since they are also the vector store's wire-level JSON keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    pub url: String,
    pub title: Option<String>,
    pub domain: String,
    pub source_command: SourceCommand,
    pub source_type: SourceType,
    pub content_type: ContentType,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub chunk_header: Option<String>,
    pub chunk_text: String,
    #[serde(flatten)]
    pub file_info: Option<FileInfo>,
    pub scraped_at: DateTime<Utc>,
    pub ingest_id: Option<String>,
    pub ingest_root: Option<String>,
}

/// One row in the vector store: a chunk's embedding plus its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

impl VectorPoint {
    /// Derive the deterministic id for `(source_id, chunk_index)` so that
    /// repeated upserts of the same chunk overwrite the prior point.
    ///
    /// Namespaced UUIDv5, grounded on `llmspell-core::ComponentId::from_name`.
    pub fn deterministic_id(source_id: &SourceId, chunk_index: usize) -> Uuid {
        const NAMESPACE: Uuid = Uuid::from_bytes([
            0xa9, 0x1c, 0x3e, 0x02, 0x4d, 0x6f, 0x4b, 0x0a, 0x9c, 0x3d, 0x1a, 0x5e, 0x7f, 0x22,
            0x6b, 0x88,
        ]);
        let name = format!("{source_id}#{chunk_index}");
        Uuid::new_v5(&NAMESPACE, name.as_bytes())
    }
}

/// A read-back payload from the vector store, as an opaque JSON mapping.
///
/// The store's wire format is untyped JSON; rather than trust it matches
/// `VectorPayload` exactly (unknown keys are round-tripped, never read),
/// query-path code goes through these accessors.
#[derive(Debug, Clone)]
pub struct PayloadView(pub Value);

impl PayloadView {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(|v| v.as_str()).map(String::from)
    }

    pub fn get_string_or(&self, key: &str, fallback: &str) -> String {
        self.get_string(key).unwrap_or_else(|| fallback.to_string())
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get_number(key).map(|n| n as usize)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(|v| v.as_bool())
    }
}
