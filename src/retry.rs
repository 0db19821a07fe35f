//! Automatic retry with exponential backoff and jitter.
//!
//! By default retries transient transport failures and HTTP 429, 500, 502,
//! 503 and 504. Every other status is terminal. The classifier is part of the
//! configuration so callers can widen or narrow that policy.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{Backoff, DEFAULT_JITTER};
use crate::client::ClientError;

/// Decides whether a failed attempt may be retried.
#[derive(Clone)]
pub struct Classifier(Arc<dyn Fn(&ClientError) -> bool + Send + Sync>);

impl Classifier {
    pub fn new<F>(classify: F) -> Self
    where
        F: Fn(&ClientError) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(classify))
    }

    /// Retry everything except client errors (other than 429) and failures
    /// that cannot succeed on a second try.
    pub fn permissive() -> Self {
        Self::new(|err| match err {
            ClientError::Decode(_) | ClientError::Config(_) | ClientError::StreamCancelled => false,
            other => match other.status() {
                Some(status) => {
                    status == StatusCode::TOO_MANY_REQUESTS || !status.is_client_error()
                }
                None => true,
            },
        })
    }

    /// Never retry.
    pub fn never() -> Self {
        Self::new(|_| false)
    }

    pub fn is_retryable(&self, err: &ClientError) -> bool {
        (self.0)(err)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(is_transient_error)
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Classifier(..)")
    }
}

/// Whether a status code indicates a transient server-side condition.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Default classification: network-level failures and transient statuses.
pub fn is_transient_error(err: &ClientError) -> bool {
    match err {
        ClientError::Http(err) => match err.status() {
            Some(status) => is_retryable_status(status),
            None => err.is_connect() || err.is_timeout() || err.is_request() || err.is_body(),
        },
        ClientError::Api { status, .. } => is_retryable_status(*status),
        ClientError::Connection(_) | ClientError::TransportRead(_) | ClientError::Parse(_) => true,
        ClientError::Decode(_) | ClientError::StreamCancelled | ClientError::Config(_) => false,
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = a single attempt).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Jitter fraction around each delay; 0.0 disables jitter.
    pub jitter: f64,
    pub classifier: Classifier,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: DEFAULT_JITTER,
            classifier: Classifier::default(),
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of retries. Uses sensible defaults.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// A single attempt, no retries.
    pub fn no_retries() -> Self {
        Self::with_retries(0)
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        self.backoff().validate()
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff().delay(attempt)
    }
}

/// Run `operation` until it succeeds, fails terminally, runs out of retries,
/// or `cancel` fires during a backoff wait.
pub async fn execute<T, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    config.validate()?;
    let backoff = config.backoff();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ClientError::StreamCancelled);
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !config.classifier.is_retryable(&err) {
            debug!(error = %err, "not retrying terminal error");
            return Err(err);
        }
        if attempt >= config.max_retries {
            warn!(attempts = attempt + 1, error = %err, "retries exhausted");
            return Err(err);
        }

        attempt += 1;
        let delay = backoff.delay(attempt);
        warn!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "request failed, retrying after backoff"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::StreamCancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
