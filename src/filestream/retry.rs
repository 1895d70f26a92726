//! Retry with exponential backoff
//!
//! Transient failures (connection errors, timeouts, 5xx, 429 and any other
//! status not listed as final) are retried with a doubling delay and jitter.
//! 400, 403, 404 and 409 are final and returned on the first attempt.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use super::transport::{HttpResponse, Transport, TransportError};

/// Statuses that are never retried
pub const NON_RETRIABLE_STATUSES: [u16; 4] = [400, 403, 404, 409];

/// Status signalling the collector's rate limit
pub const RATE_LIMITED_STATUS: u16 = 429;

/// Callback invoked when the collector rate limits a request
pub type RetryCallback = dyn Fn(u16, &str) + Send + Sync;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt before giving up
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, in `[0, 1)`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 30,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: 0.25,
        }
    }
}

/// Delay generator for one request
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: policy.initial_delay.min(policy.max_delay),
            max_delay: policy.max_delay,
            jitter: policy.jitter,
        }
    }

    /// Next delay: the current base scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`, never above `max_delay`. The base then
    /// doubles, saturating at `max_delay`.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let factor = if self.jitter > 0.0 {
            rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        let delay = self.base.mul_f64(factor).min(self.max_delay);
        self.base = self.base.saturating_mul(2).min(self.max_delay);
        delay
    }
}

/// Whether a failed attempt may be retried
pub fn is_retriable(error: &TransportError) -> bool {
    match error {
        TransportError::Connection(_) | TransportError::Timeout => true,
        TransportError::Status { status, .. } => !NON_RETRIABLE_STATUSES.contains(status),
        TransportError::Other(_) => false,
    }
}

/// POST with retries.
///
/// `sleep` performs the wait between attempts; the uploader passes
/// `std::thread::sleep`. Returns the last error once retries are exhausted.
pub fn send_with_retry<T, S>(
    transport: &T,
    url: &str,
    body: &Value,
    policy: &RetryPolicy,
    on_rate_limit: Option<&RetryCallback>,
    mut sleep: S,
) -> Result<HttpResponse, TransportError>
where
    T: Transport + ?Sized,
    S: FnMut(Duration),
{
    let mut backoff = Backoff::new(policy);
    let mut rng = rand::thread_rng();
    let mut retries = 0;

    loop {
        let error = match transport.post(url, body) {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        if !is_retriable(&error) {
            tracing::error!(url, error = %error, "request failed, not retrying");
            return Err(error);
        }
        if retries == policy.max_retries {
            return Err(error);
        }
        retries += 1;

        let delay = backoff.next_delay(&mut rng);
        if error.status() == Some(RATE_LIMITED_STATUS) {
            let message = format!(
                "Filestream rate limit exceeded, retrying in {:.1} seconds",
                delay.as_secs_f64()
            );
            if let Some(callback) = on_rate_limit {
                callback(RATE_LIMITED_STATUS, &message);
            }
            tracing::info!("{}", message);
        } else {
            tracing::warn!(
                url,
                error = %error,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                "retryable request failure"
            );
        }
        sleep(delay);
    }
}
