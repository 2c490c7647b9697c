// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

/// Raised inside an operation when its single-attempt budget expires.
///
/// Attempt timeouts are always retried; termination comes from the retry
/// policy's `max_retries` and/or overall `timeout`.
#[derive(Debug, thiserror::Error)]
#[error("attempt timed out after {0:?}")]
pub struct AttemptTimeoutError(pub Duration);

/// Backoff and termination settings for [`retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts beyond the first.  `None` = unbounded
    /// (the overall `timeout` then bounds the loop).
    pub max_retries: Option<usize>,
    /// Wall-clock budget across all attempts and waits.
    pub timeout: Option<Duration>,
    /// First backoff interval.
    pub initial_interval: Duration,
    /// Backoff ceiling.
    pub max_interval: Duration,
    /// Interval growth factor per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            timeout: None,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: Option<usize>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Backoff interval before retry number `attempt` (1-based), jittered
    /// to between 50% and 100% of the exponential value.
    fn wait_interval(&self, attempt: u32) -> Duration {
        let exp = self.initial_interval.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        let capped = exp.min(self.max_interval.as_secs_f64());
        // jitter from the subsecond clock; avoids a rand dependency and is
        // plenty to de-synchronize concurrent samples
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let jitter = 0.5 + (nanos % 1000) as f64 / 2000.0;
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Run `op` with exponential jittered backoff.
///
/// On each failure `should_retry(err)` decides whether to continue; when it
/// does, `before_retry(err)` runs (used to close and reinitialize a model
/// client after an auth failure) and `on_wait(duration)` reports the time
/// about to be spent waiting so callers can keep working-time accounting
/// separate from wall time.  Errors that `should_retry` rejects propagate
/// unchanged, as does the final error once attempts or the overall timeout
/// are exhausted.
pub async fn retry<T, Op, Fut, SR, BR, OW>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: SR,
    mut before_retry: BR,
    mut on_wait: OW,
) -> anyhow::Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    SR: FnMut(&anyhow::Error) -> bool,
    BR: FnMut(&anyhow::Error),
    OW: FnMut(Duration),
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let retries_left = policy
                    .max_retries
                    .map(|max| (attempt as usize) <= max)
                    .unwrap_or(true);
                if !retries_left || !should_retry(&err) {
                    return Err(err);
                }

                let wait = policy.wait_interval(attempt);
                if let Some(timeout) = policy.timeout {
                    if started.elapsed() + wait >= timeout {
                        return Err(err);
                    }
                }

                debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying after error: {err:#}");
                before_retry(&err);
                on_wait(wait);
                tokio::time::sleep(wait).await;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
