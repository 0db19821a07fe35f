//! Transport and stream configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::client::ClientError;
use crate::retry::RetryConfig;
use crate::sse::DONE_MARKER;

/// A secret string type for sensitive data like API keys.
/// Prevents accidental logging or display of secrets.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    /// Create a new secret string.
    pub fn new(s: String) -> Self {
        Self(s)
    }

    /// Get the underlying secret value.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

/// Generic transport options containing truly generic transport fields
/// and transport-specific configuration.
///
/// # Example
/// ```rust
/// use streamwire::options::{TransportOptions, HttpTransport, SecretString};
/// use std::time::Duration;
///
/// let options = TransportOptions {
///     timeout: Some(Duration::from_secs(30)),
///     provider: HttpTransport {
///         api_key: Some(SecretString::new("sk-...".to_string())),
///         base_url: Some("https://api.example.com".to_string()),
///         proxy: None,
///         extra_headers: None,
///     },
/// };
/// ```
#[derive(Debug, Clone)]
pub struct TransportOptions<T> {
    /// Request timeout.
    ///
    /// Plain requests use it for the whole exchange; streams only for
    /// receiving the response headers.
    pub timeout: Option<Duration>,

    /// Transport-specific options
    pub provider: T,
}

/// HTTP-specific transport options.
/// Used as the provider field in `TransportOptions<HttpTransport>`.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    /// Bearer token sent in the `Authorization` header
    pub api_key: Option<SecretString>,

    /// Base URL that relative request paths are joined to
    pub base_url: Option<String>,

    /// HTTP proxy URL
    pub proxy: Option<String>,

    /// Additional HTTP headers to include in requests
    pub extra_headers: Option<HashMap<String, String>>,
}

impl HttpTransport {
    /// Create new HTTP transport options with an API key.
    pub fn new(api_key: impl Into<SecretString>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: None,
            proxy: None,
            extra_headers: None,
        }
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set extra headers.
    pub fn with_extra_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.extra_headers = Some(headers);
        self
    }

    /// Add a single extra header.
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.extra_headers
            .get_or_insert_with(HashMap::new)
            .insert(key, value);
        self
    }
}

impl<T> TransportOptions<T> {
    /// Create new transport options with transport-specific configuration.
    pub fn new(provider: T) -> Self {
        Self {
            timeout: None,
            provider,
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options governing one streaming session.
///
/// # Example
/// ```rust
/// use streamwire::options::StreamOptions;
/// use std::time::Duration;
///
/// let options = StreamOptions::default()
///     .with_max_reconnect_attempts(5)
///     .with_idle_timeout(Duration::from_secs(30));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Reconnections allowed between two successfully decoded events.
    pub max_reconnect_attempts: u32,

    /// Delay policy between reconnections; `max_delay` caps every wait.
    pub reconnect_backoff: Backoff,

    /// Capacity of the queue between the reader task and the consumer.
    pub channel_capacity: usize,

    /// Fail a read that yields no bytes for this long.
    pub idle_timeout: Option<Duration>,

    /// Wait at least the server's `retry:` value before reconnecting.
    pub honor_retry_hint: bool,

    /// Reconnect when the server closes the stream without a sentinel.
    pub reconnect_on_eof: bool,

    /// Payload that ends the stream gracefully; `None` disables detection.
    pub sentinel: Option<String>,

    /// Retry policy for the initial connection only.
    pub connect_retry: Option<RetryConfig>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            reconnect_backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(10)),
            channel_capacity: 10,
            idle_timeout: None,
            honor_retry_hint: true,
            reconnect_on_eof: false,
            sentinel: Some(DONE_MARKER.to_string()),
            connect_retry: None,
        }
    }
}

impl StreamOptions {
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Backoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_honor_retry_hint(mut self, honor: bool) -> Self {
        self.honor_retry_hint = honor;
        self
    }

    pub fn with_reconnect_on_eof(mut self, reconnect: bool) -> Self {
        self.reconnect_on_eof = reconnect;
        self
    }

    pub fn with_sentinel(mut self, sentinel: Option<String>) -> Self {
        self.sentinel = sentinel;
        self
    }

    pub fn with_connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = Some(retry);
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.channel_capacity == 0 {
            return Err(ClientError::Config(
                "channel capacity must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ClientError::Config("idle timeout must be > 0".to_string()));
        }
        if let Some(retry) = &self.connect_retry {
            retry.validate()?;
        }
        self.reconnect_backoff.validate()
    }

    /// Whether `data` is the configured end-of-stream payload.
    pub fn is_sentinel(&self, data: &str) -> bool {
        self.sentinel
            .as_deref()
            .is_some_and(|sentinel| data.trim() == sentinel)
    }

    /// Delay before reconnection number `attempt`.
    ///
    /// The server hint raises the backoff delay but never past
    /// `reconnect_backoff.max_delay`.
    pub fn reconnect_delay(&self, attempt: u32, retry_hint: Option<Duration>) -> Duration {
        let cap = self.reconnect_backoff.max_delay;
        let delay = self.reconnect_backoff.delay(attempt);
        let delay = match retry_hint {
            Some(hint) if self.honor_retry_hint => delay.max(hint),
            _ => delay,
        };
        delay.min(cap)
    }
}
