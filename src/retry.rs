//! Retry with exponential backoff around external model calls
//!
//! Every attempt runs under its own timeout. Only retryable errors
//! (see [`RagError::is_retryable`]) trigger another attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Backoff exponent cap (base * 2^5)
const MAX_BACKOFF_SHIFT: u32 = 5;

// ============================================================================
// RetryConfig
// ============================================================================

/// Serializable retry settings (one per model client)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

// ============================================================================
// RetryPolicy
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based; the first attempt has none)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let shift = (attempt - 2).min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(1u32 << shift)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// A timed-out attempt becomes [`RagError::Timeout`]; when it is the
    /// last attempt that error is what the caller sees.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<RagError> = None;

        for attempt in 1..=self.max_attempts {
            let delay = self.backoff(attempt);
            if !delay.is_zero() {
                tracing::warn!(
                    "{} failed, retrying in {:?} (attempt {}/{})",
                    operation,
                    delay,
                    attempt,
                    self.max_attempts
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RagError::Timeout {
                    operation: operation.to_string(),
                    after_ms: self.timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::debug!("{} attempt {} failed: {}", operation, attempt, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RagError::Internal(format!("{} made no attempts", operation))
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================
