//! Backoff for transient SQLite lock contention.
//!
//! Writers on a single SQLite file serialize on the database lock. Under a
//! burst of concurrent sign-ins `busy_timeout` absorbs most waits, but a
//! transaction can still surface SQLITE_BUSY / SQLITE_LOCKED; those are
//! retried here instead of being reported to the caller.

use std::{future::Future, time::Duration};

use sqlx::Error as SqlxError;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff step.
    pub max_delay_ms: u64,
    /// Fraction of the step added as jitter, 0.0 to 1.0.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 25,
            max_delay_ms: 1000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            jitter_factor: 0.2,
        }
    }

    /// Used for federation writes, where many first-time sign-ins for the
    /// same provider can arrive together.
    pub fn high_contention() -> Self {
        Self {
            max_retries: 10,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            jitter_factor: 0.3,
        }
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let step = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);

        let jitter_range = (step as f64 * self.jitter_factor) as u64;
        let jitter = if jitter_range > 0 {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64;
            nanos % jitter_range
        } else {
            0
        };

        Duration::from_millis(step + jitter)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and their extended codes
/// (`code & 0xFF` equal to the base code).
pub fn is_retryable_error(e: &SqlxError) -> bool {
    let SqlxError::Database(db_err) = e else {
        return false;
    };
    let Some(code) = db_err.code() else {
        return false;
    };
    match code.as_ref().parse::<u32>() {
        Ok(code) => matches!(code & 0xFF, 5 | 6),
        Err(_) => false,
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the retry
/// budget is spent.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T, SqlxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SqlxError>>,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Identity store operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_retryable_error(&e) && attempt < config.max_retries => {
                let delay = config.calculate_delay(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = ?e,
                    "SQLite database is busy, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = ?e,
                        "Identity store operation failed after all retries"
                    );
                }
                return Err(e);
            }
        }
    }
}
