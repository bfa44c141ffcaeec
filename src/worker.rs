//! `BackgroundEmbedder`: the queue-draining daemon loop (`spec.md`
//! §4.6).
//!
//! Grounded on the `other_examples` codetriever worker's poll-loop
//! shape, generalized from its `Arc<AtomicBool>` shutdown flag to a
//! `tokio_util::sync::CancellationToken` — a plain bool can't be
//! `select!`-ed against an in-flight page embed the way cooperative
//! cancellation here requires.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::embedding::EmbeddingBackend;
use crate::error::CoreError;
use crate::models::{ContentType, SourceCommand};
use crate::pipeline::{DocumentMeta, EmbedPipeline};
use crate::queue::{EmbedJob, EmbedQueue, JobStatus};
use crate::reconcile::{BaselineStore, ReconcileRequest, ReconciliationStore};
use crate::scrape_client::{CrawlOptions, CrawlStatus, ScrapeClient, StartedCrawl};
use crate::source_id::SourceId;
use crate::store::VectorStore;

/// Below this fraction of the preflight-baseline expected count, a
/// completed crawl's page delivery is considered unexpectedly low.
/// `spec.md` Glossary "Baseline".
const BASELINE_WARN_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub max_concurrent_pages: usize,
    pub http_base_delay_ms: u64,
    pub http_max_delay_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_concurrent_pages: 10,
            http_base_delay_ms: 5_000,
            http_max_delay_ms: 60_000,
        }
    }
}

pub struct BackgroundEmbedder<S: ScrapeClient, E: EmbeddingBackend, V: VectorStore> {
    scrape_client: Arc<S>,
    pipeline: Arc<EmbedPipeline<E, V>>,
    queue: Arc<EmbedQueue>,
    reconciliation: Arc<ReconciliationStore>,
    baselines: Arc<BaselineStore>,
    store: Arc<V>,
    options: WorkerOptions,
}

fn detect_content_type(page: &crate::scrape_client::CrawlPage) -> ContentType {
    if page.markdown.is_some() {
        ContentType::Markdown
    } else {
        ContentType::Html
    }
}

impl<S: ScrapeClient, E: EmbeddingBackend, V: VectorStore> BackgroundEmbedder<S, E, V> {
    pub fn new(
        scrape_client: Arc<S>,
        pipeline: Arc<EmbedPipeline<E, V>>,
        queue: Arc<EmbedQueue>,
        reconciliation: Arc<ReconciliationStore>,
        baselines: Arc<BaselineStore>,
        store: Arc<V>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            scrape_client,
            pipeline,
            queue,
            reconciliation,
            baselines,
            store,
            options,
        }
    }

    /// Preflight a crawl before it starts: `map()` the target to discover
    /// the expected URL count, record it as a [`crate::reconcile::BaselineEntry`],
    /// then `start_crawl`. The discovery guardrail in [`Self::process_job`]
    /// compares the crawl's eventual page count against this baseline.
    pub async fn preflight_crawl(
        &self,
        url: &str,
        opts: &CrawlOptions,
    ) -> Result<StartedCrawl, CoreError> {
        let links = self.scrape_client.map(url, opts).await?;
        let started = self.scrape_client.start_crawl(url, opts).await?;
        self.baselines.record(started.id.clone(), links.len()).await?;
        Ok(started)
    }

    /// Cooperative poll loop: every `poll_interval`, claim due jobs and
    /// process them, until `cancel` fires. On cancellation the loop
    /// stops claiming new jobs and returns once the current pass
    /// finishes.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    println!("background embedder: cancellation received, exiting");
                    break;
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }

            if cancel.is_cancelled() {
                break;
            }

            match self.queue.claim_due(chrono::Utc::now()).await {
                Ok(jobs) => {
                    for job in jobs {
                        if cancel.is_cancelled() {
                            self.requeue_as_pending(job.id).await;
                            continue;
                        }
                        self.process_job(job, &cancel).await;
                    }
                }
                Err(e) => {
                    eprintln!("background embedder: failed to claim jobs: {e}");
                }
            }
        }
    }

    async fn requeue_as_pending(&self, id: uuid::Uuid) {
        if let Err(e) = self
            .queue
            .update(id, |job| job.status = JobStatus::Pending)
            .await
        {
            eprintln!("background embedder: failed to requeue job {id} as pending: {e}");
        }
    }

    /// Warn when a completed crawl delivered unexpectedly few pages
    /// relative to its recorded preflight baseline. Best-effort: a
    /// missing baseline (no `preflight_crawl` call was made for this
    /// job) or a read error is silently skipped, never fails the job.
    async fn check_discovery_baseline(&self, job_id: &str, delivered: usize) {
        let Ok(Some(baseline)) = self.baselines.get(job_id).await else {
            return;
        };
        if baseline.expected_count == 0 {
            return;
        }
        let ratio = delivered as f64 / baseline.expected_count as f64;
        if ratio < BASELINE_WARN_RATIO {
            eprintln!(
                "background embedder: crawl {job_id} delivered {delivered}/{} pages, below baseline",
                baseline.expected_count
            );
        }
    }

    /// Process a single claimed job through to a terminal/re-queued
    /// state, per the outcomes enumerated in `spec.md` §4.6.
    async fn process_job(&self, job: EmbedJob, cancel: &CancellationToken) {
        let report = tokio::select! {
            _ = cancel.cancelled() => {
                self.requeue_as_pending(job.id).await;
                return;
            }
            result = self.scrape_client.get_crawl_status(&job.job_id) => result,
        };

        match report {
            Ok(status) if status.status == CrawlStatus::Completed => {
                self.check_discovery_baseline(&job.job_id, status.data.len()).await;
                match self.embed_pages(&job, &status.data, cancel).await {
                    Ok(()) => {
                        let _ = self
                            .queue
                            .update(job.id, |j| j.status = JobStatus::Completed)
                            .await;
                    }
                    Err(CoreError::Cancelled) => {
                        self.requeue_as_pending(job.id).await;
                    }
                    Err(e) => {
                        let _ = self
                            .queue
                            .record_failure(
                                job.id,
                                self.options.http_base_delay_ms,
                                self.options.http_max_delay_ms,
                                e.to_string(),
                            )
                            .await;
                    }
                }
            }
            Ok(_still_scraping) => {
                // Not a failure: a crawl in progress must not consume the
                // retry budget reserved for genuine errors.
                let _ = self
                    .queue
                    .reschedule_transient(
                        job.id,
                        self.options.http_base_delay_ms,
                        self.options.http_max_delay_ms,
                        "still scraping",
                    )
                    .await;
            }
            Err(CoreError::JobNotFound) => {
                let _ = self
                    .queue
                    .update(job.id, |j| {
                        j.status = JobStatus::Failed;
                        j.last_error = Some("job not found upstream".to_string());
                    })
                    .await;
            }
            Err(e) => {
                let _ = self
                    .queue
                    .record_failure(
                        job.id,
                        self.options.http_base_delay_ms,
                        self.options.http_max_delay_ms,
                        e.to_string(),
                    )
                    .await;
            }
        }
    }

    /// Embed every page in `pages`, tracking successfully-embedded URLs
    /// per domain, then reconcile and delete whatever the reconciler
    /// says has genuinely disappeared. All deletes happen after all
    /// upserts for this pass, per the ordering guarantee in §4.6/§5.
    async fn embed_pages(
        &self,
        job: &EmbedJob,
        pages: &[crate::scrape_client::CrawlPage],
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.options.max_concurrent_pages));
        let mut tasks = tokio::task::JoinSet::new();
        let seen_by_domain: Arc<std::sync::Mutex<HashMap<String, HashSet<String>>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));

        for page in pages {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let Some(source_url) = page.metadata.resolved_url().map(|s| s.to_string()) else {
                continue;
            };
            let Some(content) = page.content().map(|s| s.to_string()) else {
                continue;
            };

            let permit = semaphore.clone().acquire_owned().await.map_err(|_| {
                CoreError::Transient("embed concurrency semaphore closed".to_string())
            })?;
            let pipeline = self.pipeline.clone();
            let title = page.metadata.title.clone();
            let content_type = detect_content_type(page);
            let collection = job.collection.clone();
            let hard_sync = job.hard_sync;
            let seen_by_domain = seen_by_domain.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let mut meta = DocumentMeta::new(
                    SourceId::from_url(source_url.clone()),
                    SourceCommand::Crawl,
                    content_type,
                );
                meta.title = title;
                meta.collection = Some(collection);
                meta.hard_sync = hard_sync;

                let result = pipeline.auto_embed(&content, &meta).await;
                if result.is_ok() {
                    if let Ok(domain) = url::Url::parse(&source_url) {
                        if let Some(host) = domain.host_str() {
                            seen_by_domain
                                .lock()
                                .unwrap()
                                .entry(host.to_string())
                                .or_default()
                                .insert(source_url.clone());
                        }
                    }
                }
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(CoreError::Transient(format!("embed task panicked: {e}"))),
            }
        }

        let seen_by_domain = Arc::try_unwrap(seen_by_domain)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();

        for (domain, seen_urls) in seen_by_domain {
            let outcome = self
                .reconciliation
                .reconcile(ReconcileRequest {
                    domain: domain.clone(),
                    seen_urls: seen_urls.into_iter().collect(),
                    hard_sync: job.hard_sync,
                    dry_run: false,
                    missing_threshold: 2,
                    grace_period: chrono::Duration::days(7),
                })
                .await?;

            for stale_url in outcome.urls_to_delete {
                self.store
                    .delete_by_url_and_source_command(&job.collection, &stale_url, SourceCommand::Crawl)
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::BackendInfo;
    use crate::scrape_client::mock::MockScrapeClient;
    use crate::scrape_client::{CrawlPage, CrawlStatusReport, PageMetadata};
    use crate::store::memory::InMemoryVectorStore;
    use async_trait::async_trait;

    struct StubBackend;

    #[async_trait]
    impl EmbeddingBackend for StubBackend {
        async fn info(&self) -> Result<BackendInfo, CoreError> {
            Ok(BackendInfo {
                model_id: "stub".into(),
                dimension: 3,
                max_input_length: None,
            })
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32; 3]).collect())
        }
    }

    fn completed_report(pages: Vec<CrawlPage>) -> CrawlStatusReport {
        CrawlStatusReport {
            status: CrawlStatus::Completed,
            total: pages.len(),
            completed: pages.len(),
            data: pages,
        }
    }

    #[tokio::test]
    async fn job_not_found_marks_failed_without_retry() {
        let scrape = Arc::new(MockScrapeClient::new());
        // No seeded response -> MockScrapeClient returns JobNotFound.
        let backend = Arc::new(StubBackend);
        let store = Arc::new(InMemoryVectorStore::new());
        let pipeline = Arc::new(EmbedPipeline::new(
            backend,
            store.clone(),
            Default::default(),
        ));
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(EmbedQueue::open(dir.path().join("queue")).unwrap());
        let reconciliation = Arc::new(ReconciliationStore::new(dir.path().join("reconciliation.json")));
        let baselines = Arc::new(BaselineStore::new(dir.path().join("crawl-baselines.json")));

        let job_id = queue
            .enqueue(crate::queue::NewJobSpec {
                job_id: "crawl-1".into(),
                url: "https://x.test".into(),
                collection: "axon".into(),
                max_retries: 3,
                source_command: SourceCommand::Crawl,
                hard_sync: false,
                api_key_ref: None,
            })
            .await
            .unwrap();

        let worker = BackgroundEmbedder::new(
            scrape,
            pipeline,
            queue.clone(),
            reconciliation,
            baselines.clone(),
            store,
            WorkerOptions::default(),
        );

        let claimed = queue.claim_due(chrono::Utc::now()).await.unwrap();
        worker
            .process_job(claimed.into_iter().next().unwrap(), &CancellationToken::new())
            .await;

        let job = queue.list(None).await.unwrap().into_iter().find(|j| j.id == job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 0);
    }

    #[tokio::test]
    async fn completed_job_embeds_pages_and_completes() {
        let scrape = Arc::new(MockScrapeClient::new());
        scrape.push_status(
            "crawl-1",
            Ok(completed_report(vec![CrawlPage {
                markdown: Some("# Hello\n\nworld".into()),
                html: None,
                metadata: PageMetadata {
                    source_url: Some("https://x.test/a".into()),
                    url: None,
                    title: Some("A".into()),
                },
            }])),
        );

        let backend = Arc::new(StubBackend);
        let store = Arc::new(InMemoryVectorStore::new());
        let pipeline = Arc::new(EmbedPipeline::new(
            backend,
            store.clone(),
            Default::default(),
        ));
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(EmbedQueue::open(dir.path().join("queue")).unwrap());
        let reconciliation = Arc::new(ReconciliationStore::new(dir.path().join("reconciliation.json")));
        let baselines = Arc::new(BaselineStore::new(dir.path().join("crawl-baselines.json")));

        let job_id = queue
            .enqueue(crate::queue::NewJobSpec {
                job_id: "crawl-1".into(),
                url: "https://x.test".into(),
                collection: "axon".into(),
                max_retries: 3,
                source_command: SourceCommand::Crawl,
                hard_sync: false,
                api_key_ref: None,
            })
            .await
            .unwrap();

        let worker = BackgroundEmbedder::new(
            scrape,
            pipeline,
            queue.clone(),
            reconciliation,
            baselines.clone(),
            store.clone(),
            WorkerOptions::default(),
        );

        let claimed = queue.claim_due(chrono::Utc::now()).await.unwrap();
        worker
            .process_job(claimed.into_iter().next().unwrap(), &CancellationToken::new())
            .await;

        let job = queue.list(None).await.unwrap().into_iter().find(|j| j.id == job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(store.count_by_url("axon", "https://x.test/a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn still_scraping_is_requeued_as_transient() {
        let scrape = Arc::new(MockScrapeClient::new());
        scrape.push_status(
            "crawl-1",
            Ok(CrawlStatusReport {
                status: CrawlStatus::Scraping,
                total: 10,
                completed: 2,
                data: vec![],
            }),
        );

        let backend = Arc::new(StubBackend);
        let store = Arc::new(InMemoryVectorStore::new());
        let pipeline = Arc::new(EmbedPipeline::new(
            backend,
            store.clone(),
            Default::default(),
        ));
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(EmbedQueue::open(dir.path().join("queue")).unwrap());
        let reconciliation = Arc::new(ReconciliationStore::new(dir.path().join("reconciliation.json")));
        let baselines = Arc::new(BaselineStore::new(dir.path().join("crawl-baselines.json")));

        let job_id = queue
            .enqueue(crate::queue::NewJobSpec {
                job_id: "crawl-1".into(),
                url: "https://x.test".into(),
                collection: "axon".into(),
                max_retries: 3,
                source_command: SourceCommand::Crawl,
                hard_sync: false,
                api_key_ref: None,
            })
            .await
            .unwrap();

        let worker = BackgroundEmbedder::new(
            scrape,
            pipeline,
            queue.clone(),
            reconciliation,
            baselines.clone(),
            store,
            WorkerOptions::default(),
        );

        let claimed = queue.claim_due(chrono::Utc::now()).await.unwrap();
        worker
            .process_job(claimed.into_iter().next().unwrap(), &CancellationToken::new())
            .await;

        let job = queue.list(None).await.unwrap().into_iter().find(|j| j.id == job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 0);
        assert_eq!(job.last_error.as_deref(), Some("still scraping"));
    }

    #[tokio::test]
    async fn preflight_crawl_records_a_baseline_from_the_map_call() {
        let scrape = Arc::new(MockScrapeClient::new());
        scrape.push_links(
            "https://x.test",
            vec![
                crate::scrape_client::MapLink { url: "https://x.test/a".into(), title: None },
                crate::scrape_client::MapLink { url: "https://x.test/b".into(), title: None },
            ],
        );

        let backend = Arc::new(StubBackend);
        let store = Arc::new(InMemoryVectorStore::new());
        let pipeline = Arc::new(EmbedPipeline::new(backend, store.clone(), Default::default()));
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(EmbedQueue::open(dir.path().join("queue")).unwrap());
        let reconciliation = Arc::new(ReconciliationStore::new(dir.path().join("reconciliation.json")));
        let baselines = Arc::new(BaselineStore::new(dir.path().join("crawl-baselines.json")));

        let worker = BackgroundEmbedder::new(
            scrape,
            pipeline,
            queue,
            reconciliation,
            baselines.clone(),
            store,
            WorkerOptions::default(),
        );

        let started = worker
            .preflight_crawl("https://x.test", &crate::scrape_client::CrawlOptions::default())
            .await
            .unwrap();

        let baseline = baselines.get(&started.id).await.unwrap().unwrap();
        assert_eq!(baseline.expected_count, 2);
    }

    #[tokio::test]
    async fn under_delivered_crawl_does_not_fail_the_job_despite_low_baseline_ratio() {
        let scrape = Arc::new(MockScrapeClient::new());
        scrape.push_status(
            "crawl-1",
            Ok(completed_report(vec![CrawlPage {
                markdown: Some("# Hello\n\nworld".into()),
                html: None,
                metadata: PageMetadata {
                    source_url: Some("https://x.test/a".into()),
                    url: None,
                    title: Some("A".into()),
                },
            }])),
        );

        let backend = Arc::new(StubBackend);
        let store = Arc::new(InMemoryVectorStore::new());
        let pipeline = Arc::new(EmbedPipeline::new(backend, store.clone(), Default::default()));
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(EmbedQueue::open(dir.path().join("queue")).unwrap());
        let reconciliation = Arc::new(ReconciliationStore::new(dir.path().join("reconciliation.json")));
        let baselines = Arc::new(BaselineStore::new(dir.path().join("crawl-baselines.json")));
        // Preflight promised 50 pages; the crawl only delivers 1 — well
        // under `BASELINE_WARN_RATIO`, which should warn but not fail.
        baselines.record("crawl-1", 50).await.unwrap();

        let job_id = queue
            .enqueue(crate::queue::NewJobSpec {
                job_id: "crawl-1".into(),
                url: "https://x.test".into(),
                collection: "axon".into(),
                max_retries: 3,
                source_command: SourceCommand::Crawl,
                hard_sync: false,
                api_key_ref: None,
            })
            .await
            .unwrap();

        let worker = BackgroundEmbedder::new(
            scrape,
            pipeline,
            queue.clone(),
            reconciliation,
            baselines,
            store,
            WorkerOptions::default(),
        );

        let claimed = queue.claim_due(chrono::Utc::now()).await.unwrap();
        worker
            .process_job(claimed.into_iter().next().unwrap(), &CancellationToken::new())
            .await;

        let job = queue.list(None).await.unwrap().into_iter().find(|j| j.id == job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
}
