//! Server-Sent Events (SSE) wire-protocol parsing.
//!
//! This module provides a pull-based, protocol-generic event stream parser
//! that can be shared by every streaming call.
//!
//! SSE format:
//! ```text
//! id: 42
//! event: update
//! data: {"key": "value"}
//! data: {"more": "lines"}
//! retry: 3000
//! : comment
//!
//! data: [DONE]
//! ```
//!
//! Detecting the `[DONE]` sentinel is left to the caller; see
//! [`is_done_marker`].

use std::str::Utf8Error;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use thiserror::Error;

use crate::client::ClientError;

/// Payload that signals the end of an event stream.
pub const DONE_MARKER: &str = "[DONE]";

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// One decoded unit of the event-stream protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolEvent {
    /// Event id, empty unless this block set one.
    pub id: String,
    /// Event type, empty unless this block set one.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Server-suggested minimum delay before reconnecting.
    pub retry: Option<Duration>,
    /// Last comment line seen before this event.
    pub comment: Option<String>,
}

impl ProtocolEvent {
    /// Create an event carrying only a data payload.
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }
}

/// Framing errors the parser cannot recover from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid UTF-8 in event stream: {0}")]
    InvalidUtf8(#[from] Utf8Error),
}

/// Errors produced by [`EventStreamParser`].
#[derive(Error, Debug)]
pub enum EventStreamError<E> {
    /// The underlying byte stream failed.
    #[error("transport error: {0}")]
    Transport(E),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A single line of the protocol with its terminator removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line<'a> {
    Empty,
    Comment(&'a str),
    Field { name: &'a str, value: &'a str },
}

fn parse_line(line: &str) -> Line<'_> {
    if line.is_empty() {
        return Line::Empty;
    }
    if let Some(comment) = line.strip_prefix(':') {
        return Line::Comment(comment);
    }
    match line.split_once(':') {
        Some((name, value)) => Line::Field {
            name,
            value: value.strip_prefix(' ').unwrap_or(value),
        },
        None => Line::Field {
            name: line,
            value: "",
        },
    }
}

fn trim_cr(mut line: Bytes) -> Bytes {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line
}

#[derive(Debug, Default)]
struct EventBuilder {
    id: Option<String>,
    event: Option<String>,
    data: Option<String>,
    retry: Option<Duration>,
    comment: Option<String>,
}

impl EventBuilder {
    fn has_content(&self) -> bool {
        self.id.is_some() || self.event.is_some() || self.data.is_some()
    }

    fn push_data(&mut self, value: &str) {
        match &mut self.data {
            Some(data) => {
                data.push('\n');
                data.push_str(value);
            }
            None => self.data = Some(value.to_owned()),
        }
    }

    /// Emit the accumulated event, or `None` for a heartbeat.
    fn take(&mut self) -> Option<ProtocolEvent> {
        if !self.has_content() {
            return None;
        }
        let EventBuilder {
            id,
            event,
            data,
            retry,
            comment,
        } = std::mem::take(self);
        Some(ProtocolEvent {
            id: id.unwrap_or_default(),
            event: event.unwrap_or_default(),
            data: data.unwrap_or_default(),
            retry,
            comment,
        })
    }
}

/// Pull-based decoder turning a stream of byte chunks into [`ProtocolEvent`]s.
///
/// The source is only polled when no complete line is buffered, so bytes past
/// the last returned event stay unread.
#[derive(Debug)]
pub struct EventStreamParser<S> {
    stream: S,
    buffer: BytesMut,
    builder: EventBuilder,
    retry_hint: Option<Duration>,
    bom_checked: bool,
    exhausted: bool,
    finished: bool,
}

impl<S> EventStreamParser<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            builder: EventBuilder::default(),
            retry_hint: None,
            bom_checked: false,
            exhausted: false,
            finished: false,
        }
    }

    /// Most recent `retry:` value seen on this stream, in any block.
    pub fn retry_hint(&self) -> Option<Duration> {
        self.retry_hint
    }

    /// Whether end of stream has been reported.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn take_line(&mut self) -> Option<Bytes> {
        if !self.bom_checked {
            let partial_bom = self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer);
            if partial_bom && !self.exhausted {
                return None;
            }
            if self.buffer.starts_with(BOM) {
                self.buffer.advance(BOM.len());
            }
            self.bom_checked = true;
        }

        let end = memchr::memchr(b'\n', &self.buffer)?;
        let mut line = self.buffer.split_to(end + 1).freeze();
        line.truncate(end);
        Some(trim_cr(line))
    }

    fn process_line(&mut self, line: &[u8]) -> Result<Option<ProtocolEvent>, ParseError> {
        let line = std::str::from_utf8(line)?;
        match parse_line(line) {
            Line::Empty => return Ok(self.builder.take()),
            Line::Comment(text) => self.builder.comment = Some(text.to_owned()),
            Line::Field { name, value } => match name {
                "data" => self.builder.push_data(value),
                "id" => self.builder.id = Some(value.to_owned()),
                "event" => self.builder.event = Some(value.to_owned()),
                "retry" => {
                    if let Ok(millis) = value.parse::<u64>() {
                        let retry = Duration::from_millis(millis);
                        self.builder.retry = Some(retry);
                        self.retry_hint = Some(retry);
                    }
                }
                _ => {}
            },
        }
        Ok(None)
    }
}

impl<S, E> EventStreamParser<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    /// Decode the next event.
    ///
    /// Returns `Ok(None)` once the underlying stream is exhausted and any
    /// partially accumulated block has been emitted.
    pub async fn next(&mut self) -> Result<Option<ProtocolEvent>, EventStreamError<E>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            while let Some(line) = self.take_line() {
                if let Some(event) = self.process_line(&line)? {
                    return Ok(Some(event));
                }
            }

            if self.exhausted {
                self.finished = true;
                if !self.buffer.is_empty() {
                    let rest = trim_cr(self.buffer.split().freeze());
                    if let Some(event) = self.process_line(&rest)? {
                        return Ok(Some(event));
                    }
                }
                return Ok(self.builder.take());
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Err(EventStreamError::Transport(err)),
                None => self.exhausted = true,
            }
        }
    }

    /// Turn the parser into a [`Stream`] that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<ProtocolEvent, EventStreamError<E>>> {
        stream::unfold(Some(self), |state| async move {
            let mut parser = state?;
            match parser.next().await {
                Ok(Some(event)) => Some((Ok(event), Some(parser))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

/// Extension trait for `reqwest::Response` to enable SSE streaming.
///
/// # Example
/// ```ignore
/// use streamwire::sse::SSEResponseExt;
///
/// let response = client.get("https://api.example.com/stream").send().await?;
///
/// let mut events = response.sse();
/// while let Some(event) = events.next().await {
///     let event = event?;
///     println!("{}: {}", event.event, event.data);
/// }
/// ```
pub trait SSEResponseExt {
    /// Convert the response body into a stream of protocol events.
    ///
    /// No sentinel handling or reconnection happens here; use a
    /// [`Session`](crate::session::Session) for that.
    fn sse(self) -> impl Stream<Item = Result<ProtocolEvent, ClientError>> + Send;
}

impl SSEResponseExt for reqwest::Response {
    fn sse(self) -> impl Stream<Item = Result<ProtocolEvent, ClientError>> + Send {
        let bytes = self
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| ClientError::TransportRead(err.to_string())));
        EventStreamParser::new(Box::pin(bytes))
            .into_stream()
            .map(|item| item.map_err(ClientError::from))
    }
}

/// Check if an SSE data payload indicates the stream is done.
///
/// # Example
/// ```
/// use streamwire::sse::is_done_marker;
///
/// assert!(is_done_marker("[DONE]"));
/// assert!(is_done_marker("  [DONE]\n"));
/// assert!(!is_done_marker(""));
/// assert!(!is_done_marker("{\"data\": \"value\"}"));
/// ```
pub fn is_done_marker(data: &str) -> bool {
    data.trim() == DONE_MARKER
}
