//! Per-domain crawl reconciliation: decide which previously-tracked URLs
//! have genuinely disappeared from a site versus merely missed one crawl
//! pass (`spec.md` §4.7).
//!
//! One JSON document, atomic temp-file-then-rename writes — the same
//! technique the settings substrate uses, since SQLite durability
//! (which the teacher relied on for everything) isn't available here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlState {
    pub last_seen_at: DateTime<Utc>,
    pub missing_consecutive: u32,
    pub first_missing_at: Option<DateTime<Utc>>,
    pub last_missing_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainState {
    pub urls: HashMap<String, UrlState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationDocument {
    pub version: u32,
    pub domains: HashMap<String, DomainState>,
}

impl Default for ReconciliationDocument {
    fn default() -> Self {
        Self {
            version: 1,
            domains: HashMap::new(),
        }
    }
}

/// Parameters for one `reconcile` call. `spec.md` §4.7.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub domain: String,
    pub seen_urls: Vec<String>,
    pub hard_sync: bool,
    pub dry_run: bool,
    pub missing_threshold: u32,
    pub grace_period: ChronoDuration,
}

impl ReconcileRequest {
    pub fn new(domain: impl Into<String>, seen_urls: Vec<String>) -> Self {
        Self {
            domain: domain.into(),
            seen_urls,
            hard_sync: false,
            dry_run: false,
            missing_threshold: 2,
            grace_period: ChronoDuration::days(7),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub urls_to_delete: Vec<String>,
    pub tracked_before: usize,
    pub tracked_after: usize,
    pub seen: usize,
}

/// Normalize a domain: lowercase. `canonicalize_url` restricts to
/// http(s) and round-trips through `Url::parse`/`to_string` so
/// equivalent URLs compare equal.
fn normalize_domain(domain: &str) -> String {
    domain.to_lowercase()
}

fn canonicalize_url(raw: &str) -> Result<String, CoreError> {
    let parsed = Url::parse(raw)
        .map_err(|e| CoreError::InvalidInput(format!("invalid url {raw}: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(CoreError::InvalidInput(format!(
            "unsupported scheme in {raw}"
        )));
    }
    Ok(parsed.to_string())
}

pub struct ReconciliationStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ReconciliationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<ReconciliationDocument, CoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                CoreError::InvalidInput(format!("corrupt reconciliation store: {e}"))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(ReconciliationDocument::default())
            }
            Err(e) => Err(CoreError::Transient(format!(
                "cannot read reconciliation store: {e}"
            ))),
        }
    }

    fn save(&self, doc: &ReconciliationDocument) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Transient(format!("cannot create config dir: {e}")))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| CoreError::InvalidInput(format!("cannot serialize store: {e}")))?;
        std::fs::write(&tmp_path, &bytes)
            .map_err(|e| CoreError::Transient(format!("cannot write temp store file: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| CoreError::Transient(format!("cannot rename store file: {e}")))?;
        Ok(())
    }

    /// Run one reconciliation pass. `now` defaults to `Utc::now()` via
    /// [`Self::reconcile`]; [`Self::reconcile_at`] takes an explicit
    /// clock for deterministic tests.
    pub async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileOutcome, CoreError> {
        self.reconcile_at(req, Utc::now()).await
    }

    pub async fn reconcile_at(
        &self,
        req: ReconcileRequest,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, CoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load()?;
        let domain = normalize_domain(&req.domain);
        let state = doc.domains.entry(domain.clone()).or_default();
        let tracked_before = state.urls.len();

        let seen: HashMap<String, ()> = req
            .seen_urls
            .iter()
            .map(|u| canonicalize_url(u).map(|c| (c, ())))
            .collect::<Result<_, _>>()?;

        let mut urls_to_delete = Vec::new();
        let mut next_urls: HashMap<String, UrlState> = HashMap::new();

        for url in seen.keys() {
            next_urls.insert(
                url.clone(),
                UrlState {
                    last_seen_at: now,
                    missing_consecutive: 0,
                    first_missing_at: None,
                    last_missing_at: None,
                },
            );
        }

        for (url, prior) in state.urls.drain() {
            if seen.contains_key(&url) {
                continue;
            }

            if req.hard_sync {
                urls_to_delete.push(url);
                continue;
            }

            let first_missing_at = prior.first_missing_at.unwrap_or(now);
            let missing_consecutive = prior.missing_consecutive + 1;
            let elapsed = now - first_missing_at;

            if missing_consecutive >= req.missing_threshold && elapsed >= req.grace_period {
                urls_to_delete.push(url);
            } else {
                next_urls.insert(
                    url,
                    UrlState {
                        last_seen_at: prior.last_seen_at,
                        missing_consecutive,
                        first_missing_at: Some(first_missing_at),
                        last_missing_at: Some(now),
                    },
                );
            }
        }

        let tracked_after = next_urls.len();
        state.urls = next_urls;

        if !req.dry_run {
            self.save(&doc)?;
        }

        Ok(ReconcileOutcome {
            urls_to_delete,
            tracked_before,
            tracked_after,
            seen: seen.len(),
        })
    }
}

#[allow(dead_code)]
fn load_for_test(path: &Path) -> Result<ReconciliationDocument, CoreError> {
    ReconciliationStore::new(path).load()
}

/// Preflight expected URL count for one crawl job id, recorded from a
/// `map()` call before the crawl starts. Used by the discovery guardrail
/// to warn when the crawl later returns unexpectedly few pages.
/// `spec.md` §3 "BaselineEntry".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub job_id: String,
    pub expected_count: usize,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BaselineDocument {
    entries: Vec<BaselineEntry>,
}

/// Cap on the number of retained baselines. `spec.md` §3: "bounded
/// (most-recent first, cap ≈ 200)".
const BASELINE_CAP: usize = 200;

/// Bounded, most-recent-first store of [`BaselineEntry`] records,
/// persisted to `crawl-baselines.json` with the same atomic
/// temp-file-then-rename technique as [`ReconciliationStore`].
pub struct BaselineStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BaselineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BaselineDocument, CoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::InvalidInput(format!("corrupt baseline store: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BaselineDocument::default()),
            Err(e) => Err(CoreError::Transient(format!(
                "cannot read baseline store: {e}"
            ))),
        }
    }

    fn save(&self, doc: &BaselineDocument) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Transient(format!("cannot create config dir: {e}")))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| CoreError::InvalidInput(format!("cannot serialize store: {e}")))?;
        std::fs::write(&tmp_path, &bytes)
            .map_err(|e| CoreError::Transient(format!("cannot write temp store file: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| CoreError::Transient(format!("cannot rename store file: {e}")))?;
        Ok(())
    }

    /// Record a preflight baseline for `job_id`, displacing any existing
    /// entry for the same id, then trim to the most recent
    /// [`BASELINE_CAP`] entries.
    pub async fn record(&self, job_id: impl Into<String>, expected_count: usize) -> Result<(), CoreError> {
        self.record_at(job_id, expected_count, Utc::now()).await
    }

    pub async fn record_at(
        &self,
        job_id: impl Into<String>,
        expected_count: usize,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let job_id = job_id.into();
        let _guard = self.lock.lock().await;
        let mut doc = self.load()?;
        doc.entries.retain(|e| e.job_id != job_id);
        doc.entries.insert(
            0,
            BaselineEntry {
                job_id,
                expected_count,
                recorded_at: now,
            },
        );
        doc.entries.truncate(BASELINE_CAP);
        self.save(&doc)
    }

    /// Look up the most recently recorded baseline for `job_id`.
    pub async fn get(&self, job_id: &str) -> Result<Option<BaselineEntry>, CoreError> {
        let _guard = self.lock.lock().await;
        let doc = self.load()?;
        Ok(doc.entries.into_iter().find(|e| e.job_id == job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_miss_is_not_enough_to_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReconciliationStore::new(dir.path().join("reconciliation.json"));

        let now = Utc::now();
        store
            .reconcile_at(
                ReconcileRequest::new("x.test", vec!["https://x.test/a".into(), "https://x.test/b".into()]),
                now,
            )
            .await
            .unwrap();

        let outcome = store
            .reconcile_at(
                ReconcileRequest::new("x.test", vec!["https://x.test/a".into()]),
                now,
            )
            .await
            .unwrap();

        assert!(outcome.urls_to_delete.is_empty());
        assert_eq!(outcome.tracked_after, 2);
    }

    #[tokio::test]
    async fn deletes_only_after_threshold_misses_and_grace_period_elapsed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReconciliationStore::new(dir.path().join("reconciliation.json"));

        let t0 = Utc::now();
        store
            .reconcile_at(
                ReconcileRequest::new("x.test", vec!["https://x.test/a".into()]),
                t0,
            )
            .await
            .unwrap();

        // First miss: within grace period, below threshold once counted.
        let t1 = t0 + ChronoDuration::days(1);
        let out1 = store
            .reconcile_at(ReconcileRequest::new("x.test", vec![]), t1)
            .await
            .unwrap();
        assert!(out1.urls_to_delete.is_empty());

        // Second miss, but still inside the grace period relative to t0.
        let t2 = t0 + ChronoDuration::days(2);
        let out2 = store
            .reconcile_at(ReconcileRequest::new("x.test", vec![]), t2)
            .await
            .unwrap();
        assert!(out2.urls_to_delete.is_empty());

        // Past the grace period with threshold already exceeded.
        let t3 = t0 + ChronoDuration::days(8);
        let out3 = store
            .reconcile_at(ReconcileRequest::new("x.test", vec![]), t3)
            .await
            .unwrap();
        assert_eq!(out3.urls_to_delete, vec!["https://x.test/a".to_string()]);
    }

    #[tokio::test]
    async fn hard_sync_deletes_immediately_without_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReconciliationStore::new(dir.path().join("reconciliation.json"));

        let now = Utc::now();
        store
            .reconcile_at(
                ReconcileRequest::new("x.test", vec!["https://x.test/a".into()]),
                now,
            )
            .await
            .unwrap();

        let mut req = ReconcileRequest::new("x.test", vec![]);
        req.hard_sync = true;
        let outcome = store.reconcile_at(req, now).await.unwrap();
        assert_eq!(outcome.urls_to_delete, vec!["https://x.test/a".to_string()]);
        assert_eq!(outcome.tracked_after, 0);
    }

    #[tokio::test]
    async fn dry_run_does_not_persist_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reconciliation.json");
        let store = ReconciliationStore::new(&path);

        let now = Utc::now();
        let mut req = ReconcileRequest::new("x.test", vec!["https://x.test/a".into()]);
        req.dry_run = true;
        store.reconcile_at(req, now).await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn baseline_record_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("crawl-baselines.json"));

        store.record("crawl-1", 42).await.unwrap();
        let entry = store.get("crawl-1").await.unwrap().unwrap();
        assert_eq!(entry.expected_count, 42);
        assert!(store.get("crawl-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn baseline_record_replaces_prior_entry_for_same_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("crawl-baselines.json"));

        store.record("crawl-1", 10).await.unwrap();
        store.record("crawl-1", 20).await.unwrap();

        let entry = store.get("crawl-1").await.unwrap().unwrap();
        assert_eq!(entry.expected_count, 20);
    }

    #[tokio::test]
    async fn baseline_store_is_capped_at_most_recent_200_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("crawl-baselines.json"));

        for i in 0..210 {
            store.record(format!("crawl-{i}"), i).await.unwrap();
        }

        // Oldest entries were evicted.
        assert!(store.get("crawl-0").await.unwrap().is_none());
        assert!(store.get("crawl-9").await.unwrap().is_none());
        // Most recent 200 survive.
        let newest = store.get("crawl-209").await.unwrap().unwrap();
        assert_eq!(newest.expected_count, 209);
        let oldest_surviving = store.get("crawl-10").await.unwrap().unwrap();
        assert_eq!(oldest_surviving.expected_count, 10);
    }
}
