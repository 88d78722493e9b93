//! Transport retry with exponential backoff.
//!
//! - Max retries: 2 (3 total attempts)
//! - Initial delay: 500ms, doubling, capped at 8s
//! - Down-jitter up to 25% (multiplier in [0.75, 1.0])
//! - Retryable: timeouts, connection errors, HTTP 408, 409, 429, every 5xx
//! - A valid `Retry-After` / `Retry-After-Ms` (0 < d < 60s) replaces backoff
//!
//! Semantic problems with a response are never retried here; they belong to
//! the repair and critique loops above.

use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use super::{LlmCallError, LlmClient, LlmRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0.25 = up to 25% reduction.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 2, initial_delay_ms: 500, max_delay_ms: 8_000, jitter_factor: 0.25 }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Returns `Some` only for a parseable value with `0 < duration < 60s`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let in_range = |d: Duration| d > Duration::ZERO && d < Duration::from_secs(60);

    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.trim().parse::<f64>()
        && ms.is_finite()
        && ms > 0.0
    {
        let duration = Duration::from_secs_f64(ms / 1000.0);
        if in_range(duration) {
            return Some(duration);
        }
    }

    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if in_range(duration) {
            return Some(duration);
        }
    }

    None
}

#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 429 | 500..=599)
}

/// `backoff_step` is 0 before the first retry, 1 before the second, etc.
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    config: &RetryConfig,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(delay) = retry_after {
        return delay;
    }

    let base = config.initial_delay().as_secs_f64() * 2.0_f64.powi(backoff_step.min(30) as i32);
    let capped = base.min(config.max_delay().as_secs_f64());

    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor.clamp(0.0, 1.0);
    Duration::from_secs_f64(capped * jitter)
}

/// Runs `request` against `client` with a per-attempt timeout, retrying
/// transient faults. A transient fault on the last attempt comes back as
/// [`LlmCallError::Exhausted`]; a permanent one comes back as-is.
pub async fn call_with_retry<C: LlmClient>(
    client: &C,
    request: &LlmRequest,
    timeout: Duration,
    config: &RetryConfig,
) -> Result<String, LlmCallError> {
    let mut retry_count = 0u32;
    loop {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, client.complete(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LlmCallError::Timeout(timeout)),
        };

        match outcome {
            Ok(text) => return Ok(text),
            Err(err) if err.is_transient() && retry_count < config.max_retries => {
                let delay = calculate_retry_delay(retry_count, config, err.retry_after());
                tracing::debug!(
                    tool = request.tool,
                    error = %err,
                    retry_count = retry_count + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    delay_ms = delay.as_millis() as u64,
                    "retrying LLM call after transient error"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(tool = request.tool, error = %err, "LLM call retries exhausted");
                return Err(LlmCallError::Exhausted {
                    attempts: retry_count + 1,
                    last: Box::new(err),
                });
            }
            Err(err) => return Err(err),
        }
    }
}
