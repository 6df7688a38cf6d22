//! Retrying remote calls.
//!
//! Transient failures back off exponentially with jitter and try again, up
//! to the policy's attempt limit. A `retry_after` from the remote is a floor
//! on the wait. Cancellation wins over both the call and the wait.

use crate::api::WorkspaceApi;
use crate::error::SyncError;
use pagesync_common::{RemoteError, SyncPolicy};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum RetryError {
    Cancelled,
    Failed { attempts: u32, error: RemoteError },
}

impl From<RetryError> for SyncError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Cancelled => SyncError::Cancelled,
            RetryError::Failed { attempts, error } => SyncError::Remote {
                attempts,
                source: error,
            },
        }
    }
}

/// Wait before retry number `attempt` (0 for the first retry), jitter excluded.
pub fn backoff(policy: &SyncPolicy, attempt: u32) -> Duration {
    let base = policy
        .initial_backoff_ms
        .saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(base.min(policy.max_backoff_ms))
}

/// Run `call` until it succeeds, fails permanently, runs out of attempts or
/// is cancelled.
///
/// When `permits` is given, each attempt holds one permit while the call is
/// in flight, never while backing off.
pub async fn with_retry<T, F, Fut>(
    policy: &SyncPolicy,
    cancel: &CancellationToken,
    permits: Option<&Semaphore>,
    operation: &'static str,
    mut call: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let permit = match permits {
            Some(semaphore) => Some(tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                permit = semaphore.acquire() => permit.map_err(|_| RetryError::Cancelled)?,
            }),
            None => None,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = call() => result,
        };
        drop(permit);

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !error.is_transient() || attempt >= max_attempts {
            if error.is_transient() {
                warn!(operation, attempt, error = %error, "giving up on transient failure");
            }
            return Err(RetryError::Failed {
                attempts: attempt,
                error,
            });
        }

        let mut wait = backoff(policy, attempt - 1);
        // Create rng here to avoid holding non-Send type across await
        let jitter_ms = rand::rng().random_range(0..wait.as_millis() as u64 / 2 + 1);
        wait += Duration::from_millis(jitter_ms);
        if let Some(floor) = error.retry_after {
            wait = wait.max(floor);
        }
        debug!(
            operation,
            attempt,
            wait_ms = wait.as_millis() as u64,
            error = %error,
            "transient failure, backing off"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// A workspace handle bundled with the run's policy, cancellation token and
/// worker pool.
pub struct Remote<'a, A> {
    pub api: &'a A,
    pub policy: &'a SyncPolicy,
    pub cancel: &'a CancellationToken,
    permits: Arc<Semaphore>,
}

impl<'a, A> Clone for Remote<'a, A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api,
            policy: self.policy,
            cancel: self.cancel,
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<'a, A: WorkspaceApi> Remote<'a, A> {
    pub fn new(api: &'a A, policy: &'a SyncPolicy, cancel: &'a CancellationToken) -> Self {
        Self {
            api,
            policy,
            cancel,
            permits: Arc::new(Semaphore::new(policy.concurrency())),
        }
    }

    /// One logical call with retries, bounded by the worker pool.
    pub async fn call<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, RetryError>
    where
        F: FnMut(&'a A) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let api = self.api;
        with_retry(
            self.policy,
            self.cancel,
            Some(self.permits.as_ref()),
            operation,
            || call(api),
        )
        .await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
