//! Crash-safe on-disk FIFO queue of `EmbedJob`s (`spec.md` §4.5).
//!
//! One JSON file per job under a queue directory, created with
//! `OpenOptions::create_new` — the Rust spelling of the `O_EXCL`
//! guarantee the spec asks for. Updates use the atomic
//! temp-file-then-rename technique the settings and reconciliation
//! stores also use; inter-process correctness otherwise relies on
//! last-writer-wins (acceptable for a single-user product).

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::SourceCommand;

/// Lifecycle state of an `EmbedJob`. `Processing` is never durable: on
/// restart any job found in this state is coerced back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// On-disk queue entry. `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedJob {
    pub id: Uuid,
    pub job_id: String,
    pub url: String,
    pub collection: String,
    pub status: JobStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_command: SourceCommand,
    pub hard_sync: bool,
    pub api_key_ref: Option<String>,
}

/// Caller-supplied fields for a new job; the queue fills in id,
/// timestamps, and initial status.
#[derive(Debug, Clone)]
pub struct NewJobSpec {
    pub job_id: String,
    pub url: String,
    pub collection: String,
    pub max_retries: u32,
    pub source_command: SourceCommand,
    pub hard_sync: bool,
    pub api_key_ref: Option<String>,
}

/// Retention window for `cleanup`.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: ChronoDuration,
    pub failed: ChronoDuration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: ChronoDuration::hours(24),
            failed: ChronoDuration::days(7),
        }
    }
}

/// `backoff(n) = min(baseDelayMs * 2^n, maxDelayMs)`, `spec.md` §4.5.
pub fn backoff(base_delay_ms: u64, max_delay_ms: u64, retries: u32) -> ChronoDuration {
    let raw = base_delay_ms.saturating_mul(1u64 << retries.min(32));
    ChronoDuration::milliseconds(raw.min(max_delay_ms) as i64)
}

pub struct EmbedQueue {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl EmbedQueue {
    /// Open (creating if needed) a queue directory.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn job_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Enqueue `spec`, or return the id of an existing non-terminal job
    /// matching `(job_id, url, collection)` instead of creating a
    /// duplicate.
    pub async fn enqueue(&self, spec: NewJobSpec) -> Result<Uuid, CoreError> {
        let _guard = self.lock.lock().await;
        let existing = self.list_locked(None)?;
        if let Some(dup) = existing.iter().find(|j| {
            j.job_id == spec.job_id
                && j.url == spec.url
                && j.collection == spec.collection
                && !matches!(j.status, JobStatus::Completed | JobStatus::Failed)
        }) {
            return Ok(dup.id);
        }

        let now = Utc::now();
        let job = EmbedJob {
            id: Uuid::new_v4(),
            job_id: spec.job_id,
            url: spec.url,
            collection: spec.collection,
            status: JobStatus::Pending,
            retries: 0,
            max_retries: spec.max_retries,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
            source_command: spec.source_command,
            hard_sync: spec.hard_sync,
            api_key_ref: spec.api_key_ref,
        };

        let path = self.job_path(job.id);
        let bytes = serde_json::to_vec_pretty(&job)
            .map_err(|e| CoreError::InvalidInput(format!("cannot serialize job: {e}")))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| CoreError::Transient(format!("cannot create job file: {e}")))?;
        file.write_all(&bytes)
            .map_err(|e| CoreError::Transient(format!("cannot write job file: {e}")))?;

        Ok(job.id)
    }

    /// List jobs, optionally filtered by status. Any job found in
    /// `processing` is coerced to `pending` and rewritten to disk
    /// (crash recovery).
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<EmbedJob>, CoreError> {
        let _guard = self.lock.lock().await;
        self.list_locked(status)
    }

    fn list_locked(&self, status: Option<JobStatus>) -> Result<Vec<EmbedJob>, CoreError> {
        let mut jobs = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| CoreError::Transient(format!("cannot read queue dir: {e}")))?;

        for entry in entries {
            let entry = entry.map_err(|e| CoreError::Transient(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let mut job = load_job(&path)?;
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
                job.updated_at = Utc::now();
                save_job(&path, &job)?;
            }
            jobs.push(job);
        }

        if let Some(want) = status {
            jobs.retain(|j| j.status == want);
        }
        Ok(jobs)
    }

    /// Apply `patch` to the job with id `id` and persist the result.
    pub async fn update(
        &self,
        id: Uuid,
        patch: impl FnOnce(&mut EmbedJob),
    ) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        let path = self.job_path(id);
        let mut job = load_job(&path)?;
        patch(&mut job);
        job.updated_at = Utc::now();
        save_job(&path, &job)
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        let path = self.job_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) | Err(_) if !path.exists() => Ok(()),
            Err(e) => Err(CoreError::Transient(format!("cannot remove job file: {e}"))),
        }
    }

    /// Claim every job that is `pending` and due (`next_attempt_at <=
    /// now`), sorted by `created_at`, marking each `processing` on disk
    /// before returning it.
    pub async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<EmbedJob>, CoreError> {
        let _guard = self.lock.lock().await;
        let mut due: Vec<EmbedJob> = self
            .list_locked(Some(JobStatus::Pending))?
            .into_iter()
            .filter(|j| j.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|j| j.created_at);

        for job in &mut due {
            job.status = JobStatus::Processing;
            job.updated_at = Utc::now();
            save_job(&self.job_path(job.id), job)?;
        }

        Ok(due)
    }

    /// Apply the retry policy after a failed attempt: increment
    /// `retries`, and either reschedule as `pending` with backoff or
    /// mark `failed` once `max_retries` is exhausted.
    pub async fn record_failure(
        &self,
        id: Uuid,
        base_delay_ms: u64,
        max_delay_ms: u64,
        error: impl Into<String>,
    ) -> Result<(), CoreError> {
        let error = error.into();
        self.update(id, |job| {
            job.retries += 1;
            job.last_error = Some(error.clone());
            if job.retries < job.max_retries {
                job.status = JobStatus::Pending;
                job.next_attempt_at =
                    Utc::now() + backoff(base_delay_ms, max_delay_ms, job.retries);
            } else {
                job.status = JobStatus::Failed;
            }
        })
        .await
    }

    /// Re-queue a job that is not failing, merely not yet ready (e.g. a
    /// crawl still in progress). Unlike `record_failure`, this never
    /// increments `retries` and never transitions to `Failed`: a crawl
    /// that legitimately takes many poll cycles must not burn the same
    /// failure budget reserved for genuine errors.
    pub async fn reschedule_transient(
        &self,
        id: Uuid,
        base_delay_ms: u64,
        max_delay_ms: u64,
        reason: impl Into<String>,
    ) -> Result<(), CoreError> {
        let reason = reason.into();
        self.update(id, |job| {
            job.status = JobStatus::Pending;
            job.last_error = Some(reason.clone());
            job.next_attempt_at =
                Utc::now() + backoff(base_delay_ms, max_delay_ms, job.retries);
        })
        .await
    }

    /// Remove `completed` jobs older than `policy.completed` and
    /// `failed` jobs older than `policy.failed`. Never touches
    /// `pending`/`processing`.
    pub async fn cleanup(&self, policy: RetentionPolicy) -> Result<usize, CoreError> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let jobs = self.list_locked(None)?;
        let mut removed = 0;

        for job in jobs {
            let cutoff = match job.status {
                JobStatus::Completed => Some(policy.completed),
                JobStatus::Failed => Some(policy.failed),
                _ => None,
            };
            if let Some(window) = cutoff {
                if now - job.updated_at >= window {
                    let path = self.job_path(job.id);
                    std::fs::remove_file(&path)
                        .map_err(|e| CoreError::Transient(format!("cannot remove job file: {e}")))?;
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

fn load_job(path: &Path) -> Result<EmbedJob, CoreError> {
    let bytes = std::fs::read(path)
        .map_err(|e| CoreError::Transient(format!("cannot read job file: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::InvalidInput(format!("corrupt job file {path:?}: {e}")))
}

fn save_job(path: &Path, job: &EmbedJob) -> Result<(), CoreError> {
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(job)
        .map_err(|e| CoreError::InvalidInput(format!("cannot serialize job: {e}")))?;
    std::fs::write(&tmp_path, &bytes)
        .map_err(|e| CoreError::Transient(format!("cannot write temp job file: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| CoreError::Transient(format!("cannot rename job file: {e}")))?;
    Ok(())
}
