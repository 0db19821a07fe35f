//! HTTP client utilities and the transport seam used by streaming sessions.
//!
//! This module provides reusable HTTP client construction, a replayable
//! request description, and the [`Transport`] trait that sessions use to
//! (re)open connections.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE,
};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::ClientError;
use crate::options::{HttpTransport, TransportOptions};

/// Body chunks of an open connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>;

/// Opens connections for streaming sessions.
///
/// Implementations must be able to issue the same request any number of
/// times; sessions call [`connect`](Transport::connect) again on reconnection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request` and return the body once a 2xx response is received.
    ///
    /// A non-2xx status must be reported as [`ClientError::Api`].
    async fn connect(&self, request: &ApiRequest) -> Result<ByteStream, ClientError>;
}

/// A request that can be sent verbatim any number of times.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Absolute URL, or a path joined to the transport's base URL.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Add a header, rejecting invalid names or values.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, ClientError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::Config(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::Config(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `body` as JSON and set the content type.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ClientError> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }
}

/// Build a configured HTTP client from transport options.
///
/// No overall timeout is installed on the client: it would also cut off
/// long-lived streams. Timeouts are applied per request instead.
///
/// # Example
/// ```ignore
/// let client = build_http_client(&transport_options)?;
/// ```
pub fn build_http_client(
    transport_options: &TransportOptions<HttpTransport>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder();

    if let Some(timeout) = transport_options.timeout {
        builder = builder.connect_timeout(timeout);
    }

    if let Some(proxy_url) = &transport_options.provider.proxy {
        if let Ok(proxy) = reqwest::Proxy::all(proxy_url) {
            builder = builder.proxy(proxy);
        }
    }

    builder.build()
}

/// Add extra headers to a request if specified in transport options.
///
/// # Example
/// ```ignore
/// let mut req = client.post(url);
/// req = add_extra_headers(req, &transport_options.provider.extra_headers);
/// ```
pub fn add_extra_headers(
    mut request: RequestBuilder,
    extra_headers: &Option<HashMap<String, String>>,
) -> RequestBuilder {
    if let Some(headers) = extra_headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
}

/// Turn a non-2xx response body into a structured error.
///
/// Understands the common `{"error": {"message": ..., "type": ...}}` shape and
/// falls back to the raw body.
pub fn api_error(status: StatusCode, body: &str) -> ClientError {
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: ErrorBody {
                message,
                error_type: Some(error_type),
            },
        }) => format!("{error_type}: {message}"),
        Ok(envelope) => envelope.error.message,
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("request rejected")
            .to_string(),
        Err(_) => body.trim().to_string(),
    };
    ClientError::Api { status, message }
}

/// Pass 2xx responses through; decode anything else into [`ClientError::Api`].
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(api_error(status, &body))
}

/// reqwest-backed [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    options: TransportOptions<HttpTransport>,
}

impl HttpConnector {
    pub fn new(options: TransportOptions<HttpTransport>) -> Result<Self, ClientError> {
        let client = build_http_client(&options)?;
        Ok(Self { client, options })
    }

    /// Use an existing `reqwest::Client`.
    pub fn with_client(client: Client, options: TransportOptions<HttpTransport>) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &TransportOptions<HttpTransport> {
        &self.options
    }

    fn resolve_url(&self, url: &str) -> Result<String, ClientError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.to_string());
        }
        let base = self.options.provider.base_url.as_deref().ok_or_else(|| {
            ClientError::Config(format!("relative URL {url:?} requires a base URL"))
        })?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        ))
    }

    fn prepare(
        &self,
        request: &ApiRequest,
        event_stream: bool,
    ) -> Result<RequestBuilder, ClientError> {
        let url = self.resolve_url(&request.url)?;
        let mut req = self.client.request(request.method.clone(), &url);

        if event_stream {
            req = req
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache");
        }
        if let Some(api_key) = &self.options.provider.api_key {
            req = req.header(AUTHORIZATION, format!("Bearer {}", api_key.expose_secret()));
        }
        req = add_extra_headers(req, &self.options.provider.extra_headers);
        req = req.headers(request.headers.clone());

        if let Some(body) = &request.body {
            req = req.body(body.clone());
        }
        Ok(req)
    }

    /// Send a plain request; the timeout covers the whole exchange.
    pub async fn send(&self, request: &ApiRequest) -> Result<reqwest::Response, ClientError> {
        let mut req = self.prepare(request, false)?;
        if let Some(timeout) = self.options.timeout {
            req = req.timeout(timeout);
        }
        debug!(method = %request.method, url = %request.url, "sending request");
        ensure_success(req.send().await?).await
    }
}

#[async_trait]
impl Transport for HttpConnector {
    async fn connect(&self, request: &ApiRequest) -> Result<ByteStream, ClientError> {
        let req = self.prepare(request, true)?;
        debug!(method = %request.method, url = %request.url, "opening event stream connection");

        let response = match self.options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, req.send())
                .await
                .map_err(|_| {
                    ClientError::Connection(format!("no response headers within {timeout:?}"))
                })??,
            None => req.send().await?,
        };
        let response = ensure_success(response).await?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| ClientError::TransportRead(err.to_string())));
        Ok(Box::pin(body))
    }
}
