// ===============================
// src/retry.rs
// ===============================
//
// Retry policy untuk setiap panggilan ke exchange:
// - Rate limit (429)  -> tunggu base_delay * 2^attempt, lalu ulangi operasi dari awal
// - Error lain        -> langsung gagal, tanpa retry
// - Retry habis       -> gagal
// Semua kegagalan keluar sebagai satu jenis error: OperationFailed.
//
use std::future::Future;

use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::gateway::GatewayError;
use crate::metrics::{FATAL_FAILURES, RATE_LIMIT_RETRIES, REMOTE_CALLS};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// The only error callers of a wrapped operation ever see.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("exchange operation {op} failed: {message}")]
pub struct OperationFailed {
    pub op: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, base_delay: DEFAULT_BASE_DELAY }
    }
}

/// Per-call bookkeeping, never shared between calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryContext {
    fn can_retry(&self) -> bool { self.attempt + 1 < self.max_attempts }

    /// Backoff before the next attempt: `base_delay * 2^attempt`.
    pub fn delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.base_delay.saturating_mul(factor)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        // minimal satu percobaan
        Self { max_attempts: max_attempts.max(1), base_delay }
    }

    fn context(&self) -> RetryContext {
        RetryContext { attempt: 0, max_attempts: self.max_attempts.max(1), base_delay: self.base_delay }
    }

    /// Run `operation`, retrying rate-limit failures with exponential backoff.
    ///
    /// `operation` is re-invoked from scratch on every attempt. Any failure that
    /// is not a rate limit, or a rate limit on the last attempt, comes back as
    /// [`OperationFailed`] carrying the gateway error text.
    pub async fn call<T, F, Fut>(&self, op: &'static str, mut operation: F) -> Result<T, OperationFailed>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut ctx = self.context();
        loop {
            REMOTE_CALLS.with_label_values(&[op]).inc();
            match operation().await {
                Ok(v) => {
                    if ctx.attempt > 0 {
                        debug!(op, attempts = ctx.attempt + 1, "succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) if e.is_rate_limited() && ctx.can_retry() => {
                    let delay = ctx.delay();
                    warn!(
                        op,
                        attempt = ctx.attempt + 1,
                        max_attempts = ctx.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "rate limit hit, backing off"
                    );
                    RATE_LIMIT_RETRIES.with_label_values(&[op]).inc();
                    sleep(delay).await;
                    ctx.attempt += 1;
                }
                Err(e) => {
                    FATAL_FAILURES.with_label_values(&[op]).inc();
                    return Err(OperationFailed { op, message: e.to_string() });
                }
            }
        }
    }
}
