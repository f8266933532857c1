//! Exponential backoff for GET requests

use super::{Transport, TransportResponse};
use crate::{error::Error, Result};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use url::Url;

/// Retry schedule: `base_delay * 2^attempt * (1 + U[0, jitter])`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the random multiplicative jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        self.base_delay_for_attempt(attempt).mul_f64(1.0 + jitter)
    }
}

/// Statuses worth retrying: 5xx, 408 and 429
pub fn should_retry_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

/// GET `url`, retrying retryable statuses and transient network failures.
///
/// Other 4xx statuses fail immediately with [`Error::HttpStatus`]. Cancelling
/// `cancel` interrupts both the request and the backoff sleep with
/// [`Error::Aborted`].
#[instrument(skip_all, fields(url = %url))]
pub async fn fetch_with_retry(
    transport: &dyn Transport,
    url: &Url,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<TransportResponse> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Aborted),
            outcome = transport.get(url) => outcome,
        };

        let error = match outcome {
            Ok(response) if response.is_success() => return Ok(response),
            Ok(response) => {
                let error = Error::HttpStatus {
                    url: url.to_string(),
                    status: response.status,
                };
                if !should_retry_status(response.status) {
                    return Err(error);
                }
                error
            }
            Err(e) if e.is_transient_network() => e,
            Err(e) => return Err(e),
        };

        if attempt >= policy.max_retries {
            warn!(attempts = attempt + 1, error = %error, "Giving up after retries");
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Request failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Aborted),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
