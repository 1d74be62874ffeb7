//! Backoff, concurrency caps and cancellation for every fallible IMAP call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{ArchiveError, ArchiveResult};

/// Exponential backoff with ±20% jitter, capped at 30 seconds.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `k + 1`, i.e. after the `k`-th failure:
    /// `base * 2^(k-1)`, jittered, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp_ms = self.base_delay.as_millis() as u64 * (1u64 << shift);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        let jittered = Duration::from_millis((exp_ms as f64 * jitter) as u64);
        jittered.min(self.max_delay)
    }
}

/// Cancellation-aware backoff sleep.
pub async fn sleep_backoff(
    policy: &RetryPolicy,
    attempt: u32,
    cancel: &CancellationToken,
) -> ArchiveResult<()> {
    let delay = policy.backoff_delay(attempt);
    debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
    tokio::select! {
        _ = cancel.cancelled() => Err(ArchiveError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Generic retry driver for operations that carry no connection state (the
/// engine keeps its own loop for fetches, where a torn socket has to be
/// re-dialed between attempts).
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> ArchiveResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ArchiveResult<T>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                debug!(attempt, error = %e, "retryable failure");
                sleep_backoff(policy, attempt, cancel).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Holds one unit of both caps for the duration of a fetch.
pub struct LimiterPermit {
    _global: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

/// Process-global concurrency limiter: one semaphore across all accounts
/// plus one per host. Tokio semaphores queue waiters FIFO, which bounds
/// head-of-line latency within a host.
pub struct Limiter {
    global: Arc<Semaphore>,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    host_cap: usize,
}

impl Limiter {
    pub fn new(global_cap: usize, host_cap: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_cap.max(1))),
            per_host: Mutex::new(HashMap::new()),
            host_cap: host_cap.max(1),
        }
    }

    /// Waits for a slot under both caps. Cancellation aborts waiters
    /// immediately.
    pub async fn acquire(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> ArchiveResult<LimiterPermit> {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let host_sem = {
            let mut map = self.per_host.lock().await;
            map.entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.host_cap)))
                .clone()
        };

        let global = tokio::select! {
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            permit = self.global.clone().acquire_owned() => {
                permit.map_err(|_| ArchiveError::Cancelled)?
            }
        };
        let host = tokio::select! {
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            permit = host_sem.acquire_owned() => {
                permit.map_err(|_| ArchiveError::Cancelled)?
            }
        };

        Ok(LimiterPermit {
            _global: global,
            _host: host,
        })
    }
}
