//! Typed error kinds shared across the ingestion and retrieval core.
//!
//! Every public entry point returns `Result<T, CoreError>` rather than a
//! bare `anyhow::Error`, so callers (the queue, the worker, the pipeline)
//! can pattern-match on retryability instead of string-sniffing a message.
//! The CLI binary converts to `anyhow::Result` at the boundary.

use thiserror::Error;

/// Error kinds produced by the ingestion/retrieval core.
///
/// See `spec.md` §7 for the authoritative description of each variant's
/// propagation policy.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input that will never succeed on retry: empty content, an
    /// unparseable URL, an unknown setting key.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A retryable HTTP status (408/429/5xx) or transport fault from an
    /// external collaborator (embedding backend or vector store).
    #[error("backend unavailable (status {status:?}): {message}")]
    BackendUnavailable {
        status: Option<u16>,
        message: String,
    },

    /// The upstream crawl job id is gone or was never valid.
    #[error("job not found upstream")]
    JobNotFound,

    /// The vector store collection exists with an incompatible vector
    /// size. Fatal; requires operator intervention.
    #[error("dimension mismatch: collection expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// `ensureCollection` failed once; the pipeline's cache must be
    /// cleared so the next call re-attempts instead of replaying this
    /// failure forever.
    #[error("collection initialization failed: {0}")]
    PoisonedCollectionInit(String),

    /// A catch-all recoverable condition, e.g. "crawl still scraping".
    /// Callers should re-queue rather than surface this to a user.
    #[error("transient: {0}")]
    Transient(String),

    /// Cooperative cancellation was observed. Not logged as an error.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// Whether a caller (queue, worker) should retry the operation that
    /// produced this error rather than treat it as terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::BackendUnavailable { .. } | CoreError::Transient(_)
        )
    }

    /// Build a `BackendUnavailable` from an HTTP status code, classifying
    /// per the retryable-status set in `spec.md` §4.2: {408, 429, 500,
    /// 502, 503, 504}.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        CoreError::BackendUnavailable {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
    }
}
