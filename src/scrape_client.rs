//! The opaque scrape/crawl backend collaborator (`spec.md` §1/§6).
//!
//! `BackgroundEmbedder` only needs three operations against whatever
//! service actually drives crawling; this trait keeps that service out
//! of the core entirely, the same way `VectorStore`/`EmbeddingBackend`
//! keep their transports out. `MockScrapeClient` is the fixture the
//! worker's own tests are built against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Scraping,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct PageMetadata {
    pub source_url: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
}

impl PageMetadata {
    /// `metadata.sourceURL` if present, else `metadata.url` — `spec.md`
    /// §6 accepts either key.
    pub fn resolved_url(&self) -> Option<&str> {
        self.source_url.as_deref().or(self.url.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrawlPage {
    pub markdown: Option<String>,
    pub html: Option<String>,
    pub metadata: PageMetadata,
}

impl CrawlPage {
    /// `page.markdown || page.html`, `spec.md` §4.6 step 2.
    pub fn content(&self) -> Option<&str> {
        self.markdown.as_deref().or(self.html.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct CrawlStatusReport {
    pub status: CrawlStatus,
    pub total: usize,
    pub completed: usize,
    pub data: Vec<CrawlPage>,
}

#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    pub limit: Option<usize>,
    pub exclude_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StartedCrawl {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct MapLink {
    pub url: String,
    pub title: Option<String>,
}

/// Opaque scrape/crawl backend. `get_crawl_status` drives the poll loop;
/// `map` backs the discovery-guardrail preflight in
/// [`crate::worker::BackgroundEmbedder::preflight_crawl`]; `start_crawl`
/// is kept for completeness of the collaborator contract even though the
/// worker itself never initiates a crawl.
#[async_trait]
pub trait ScrapeClient: Send + Sync {
    async fn get_crawl_status(&self, job_id: &str) -> Result<CrawlStatusReport, CoreError>;
    async fn start_crawl(&self, url: &str, opts: &CrawlOptions) -> Result<StartedCrawl, CoreError>;
    async fn map(&self, url: &str, opts: &CrawlOptions) -> Result<Vec<MapLink>, CoreError>;
}
