//! Shared retry/backoff/jitter helper for the HTTP collaborators.
//!
//! Generalizes the teacher's `embed_openai` retry loop (`src/embedding.rs`):
//! same retryable-status-set idea, extended with jitter and a pluggable
//! per-attempt request builder so the same policy backs both the
//! `EmbeddingBackend` and `VectorStore` HTTP implementations.

use std::time::Duration;

use rand::Rng;
use reqwest::{RequestBuilder, Response};

use crate::error::CoreError;

/// Retry/backoff knobs, matching `spec.md` §4.2's `http.*` settings.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP statuses the policy considers worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    CoreError::is_retryable_status(status)
}

/// Exponential backoff with ±25% jitter: `min(base * 2^attempt, max)`.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let raw = policy
        .base_delay_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(policy.max_delay_ms);
    let jitter_frac = rand::thread_rng().gen_range(-0.25..=0.25);
    let jittered = (raw as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// Whether a transport-level `reqwest::Error` is worth retrying: connection
/// reset/refused, timed out, DNS failure, or an aborted request.
fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Send a request built fresh on every attempt (since `RequestBuilder`
/// cannot be cloned), retrying per `policy` on retryable statuses and
/// transport errors. Returns the first successful response, or the last
/// failure classified as a `CoreError`.
pub async fn send_with_retry<F>(policy: &RetryPolicy, mut build: F) -> Result<Response, CoreError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut last_err: Option<CoreError> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(policy, attempt - 1)).await;
        }

        let request = build().timeout(policy.timeout);
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                if is_retryable_status(status.as_u16()) {
                    let message = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<unreadable body>".to_string());
                    last_err = Some(CoreError::from_http_status(status.as_u16(), message));
                    continue;
                }
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<unreadable body>".to_string());
                return Err(CoreError::from_http_status(status.as_u16(), message));
            }
            Err(err) => {
                if is_retryable_transport_error(&err) {
                    last_err = Some(CoreError::BackendUnavailable {
                        status: None,
                        message: err.to_string(),
                    });
                    continue;
                }
                return Err(CoreError::BackendUnavailable {
                    status: None,
                    message: err.to_string(),
                });
            }
        }
    }

    Err(last_err.unwrap_or(CoreError::Transient(
        "retry budget exhausted with no recorded error".to_string(),
    )))
}
