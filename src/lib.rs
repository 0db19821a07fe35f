//! # streamwire - Resilient Server-Sent Events client
//!
//! A small, pragmatic Rust library for consuming `text/event-stream` APIs
//! over HTTP, with automatic reconnection and request retries.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Incremental, pull-based SSE parser (LF and CRLF, comments, `retry:` hints)
//! - Exponential backoff with jitter, shared by retries and reconnects
//! - Pluggable retry classification
//! - Streaming sessions that reconnect mid-stream and latch a terminal error
//! - Typed JSON decoding of event payloads
//!
//! ## Architecture
//!
//! - **`sse`**: bytes to [`ProtocolEvent`]s
//! - **`backoff`** / **`retry`**: delay policy and the retry executor
//! - **`http`**: the [`Transport`] seam and its reqwest implementation
//! - **`session`**: the reconnecting state machine behind [`Session`]
//! - **`client`**: [`Client`], tying transport, retry and stream options together
//!
//! ## Example
//! ```no_run
//! use futures::StreamExt;
//! use streamwire::{ApiRequest, Client};
//! use streamwire::options::{HttpTransport, TransportOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(TransportOptions::new(
//!         HttpTransport::new("your-api-key").with_base_url("https://api.example.com".to_string()),
//!     ))?;
//!
//!     let request = ApiRequest::post("/v1/stream").json(&serde_json::json!({ "stream": true }))?;
//!     let session = client.open_stream(request).await?;
//!
//!     let mut events = session.events();
//!     while let Some(event) = events.next().await {
//!         println!("{}: {}", event.event, event.data);
//!     }
//!     if let Some(err) = session.error() {
//!         eprintln!("stream failed: {err}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod http;
pub mod options;
pub mod retry;
pub mod session;
pub mod sse;
pub mod stream;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use backoff::Backoff;
pub use client::{Client, ClientError};
pub use http::{ApiRequest, ByteStream, HttpConnector, Transport};
pub use options::{StreamOptions, TransportOptions};
pub use retry::{Classifier, RetryConfig};
pub use session::{open_stream, Session, SessionEvents, SessionPhase};
pub use sse::{EventStreamParser, ProtocolEvent};
pub use stream::TypedStream;
