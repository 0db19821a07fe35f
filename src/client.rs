//! Client entry point and error types.

use std::sync::Arc;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::http::{ApiRequest, HttpConnector};
use crate::options::{HttpTransport, StreamOptions, TransportOptions};
use crate::retry::{self, RetryConfig};
use crate::session::{self, Session};
use crate::sse::{EventStreamError, ParseError};

/// Errors that can occur during client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The HTTP layer failed before a response was available.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("API error ({status}): {message}")]
    Api { status: StatusCode, message: String },

    /// The transport connection could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Reading from an established connection failed.
    #[error("Transport read error: {0}")]
    TransportRead(String),

    #[error("Event stream parse error: {0}")]
    Parse(#[from] ParseError),

    /// A payload could not be decoded into the caller's type.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Stream cancelled")]
    StreamCancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the server explicitly refused the request.
    pub fn is_rejection(&self) -> bool {
        match self {
            ClientError::Api { .. } => true,
            ClientError::Http(err) => err.status().is_some(),
            _ => false,
        }
    }

    /// Whether the failure happened while reading an accepted stream.
    pub fn is_read_failure(&self) -> bool {
        matches!(self, ClientError::TransportRead(_) | ClientError::Parse(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::StreamCancelled)
    }

    /// HTTP status attached to the error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(err) => err.status(),
            _ => None,
        }
    }
}

impl From<EventStreamError<ClientError>> for ClientError {
    fn from(err: EventStreamError<ClientError>) -> Self {
        match err {
            EventStreamError::Transport(err) => err,
            EventStreamError::Parse(err) => ClientError::Parse(err),
        }
    }
}

/// HTTP client that shares one retry policy between plain requests and
/// event streams.
///
/// # Example
/// ```no_run
/// use futures::StreamExt;
/// use streamwire::client::Client;
/// use streamwire::http::ApiRequest;
/// use streamwire::options::{HttpTransport, TransportOptions};
///
/// # async fn run() -> Result<(), streamwire::ClientError> {
/// let client = Client::new(TransportOptions::new(
///     HttpTransport::new("sk-...").with_base_url("https://api.example.com".to_string()),
/// ))?;
///
/// let session = client.open_stream(ApiRequest::get("/v1/events")).await?;
/// let mut events = session.events();
/// while let Some(event) = events.next().await {
///     println!("{}", event.data);
/// }
/// if let Some(err) = session.error() {
///     eprintln!("stream failed: {err}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    connector: Arc<HttpConnector>,
    retry: RetryConfig,
    stream_options: StreamOptions,
}

impl Client {
    /// Create a client with default retry and stream options.
    pub fn new(transport_options: TransportOptions<HttpTransport>) -> Result<Self, ClientError> {
        Ok(Self::from_connector(HttpConnector::new(transport_options)?))
    }

    /// Create a client around an existing connector.
    pub fn from_connector(connector: HttpConnector) -> Self {
        Self {
            connector: Arc::new(connector),
            retry: RetryConfig::default(),
            stream_options: StreamOptions::default(),
        }
    }

    /// Set the retry policy used for plain requests.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the options used for every stream opened by this client.
    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.stream_options = options;
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn stream_options(&self) -> &StreamOptions {
        &self.stream_options
    }

    pub fn connector(&self) -> &HttpConnector {
        &self.connector
    }

    /// Send a plain request under the client's retry policy.
    pub async fn send(&self, request: &ApiRequest) -> Result<reqwest::Response, ClientError> {
        self.send_with(request, &CancellationToken::new()).await
    }

    /// Like [`send`](Self::send), aborting retries when `cancel` fires.
    pub async fn send_with(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ClientError> {
        retry::execute(|| self.connector.send(request), &self.retry, cancel).await
    }

    /// Send a plain request and decode the JSON response body.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<T, ClientError> {
        let response = self.send(request).await?;
        let body = response.bytes().await?;
        debug!(bytes = body.len(), "decoding response body");
        Ok(serde_json::from_slice(&body)?)
    }

    /// Open a streaming session for `request`.
    pub async fn open_stream(&self, request: ApiRequest) -> Result<Session, ClientError> {
        self.open_stream_with(request, CancellationToken::new()).await
    }

    /// Open a streaming session bound to the caller's cancellation token.
    pub async fn open_stream_with(
        &self,
        request: ApiRequest,
        cancel: CancellationToken,
    ) -> Result<Session, ClientError> {
        session::open_stream(
            Arc::clone(&self.connector),
            request,
            self.stream_options.clone(),
            cancel,
        )
        .await
    }
}
