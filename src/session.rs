//! Streaming sessions.
//!
//! A [`Session`] owns one logical subscription. A background task connects,
//! drives the [`EventStreamParser`], forwards events into a bounded queue and
//! reconnects with backoff when an accepted connection fails mid-read.
//!
//! ```text
//! Connecting ──► Reading ◄──► Reconnecting
//!      │            │               │
//!      └────────────┴──► Closed ◄───┘
//! ```
//!
//! Errors never interrupt iteration. The event sequence simply ends and the
//! cause is available from [`Session::error`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info, warn};

use crate::client::ClientError;
use crate::http::{ApiRequest, ByteStream, Transport};
use crate::options::StreamOptions;
use crate::retry;
use crate::sse::{EventStreamParser, ProtocolEvent};
use crate::stream::TypedStream;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Issuing the request.
    Connecting,
    /// Pulling events from an accepted connection.
    Reading,
    /// Waiting before reconnection number `attempt`.
    Reconnecting { attempt: u32 },
    /// Terminal; no further events.
    Closed,
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    terminal_error: Option<Arc<ClientError>>,
    closed: bool,
    reconnect_enabled: bool,
    retry_attempt: u32,
    connections: u64,
}

/// State shared by the producer task and every consumer-side handle.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    sentinel: Option<String>,
}

impl Shared {
    fn new(cancel: CancellationToken, sentinel: Option<String>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                phase: SessionPhase::Connecting,
                terminal_error: None,
                closed: false,
                reconnect_enabled: true,
                retry_attempt: 0,
                connections: 1,
            }),
            cancel,
            sentinel,
        }
    }

    /// Record `err` unless an error is already latched. Returns whether it was stored.
    pub(crate) fn latch_error(&self, err: ClientError) -> bool {
        let mut state = self.state.lock();
        state.reconnect_enabled = false;
        if let Some(existing) = &state.terminal_error {
            debug!(existing = %existing, discarded = %err, "terminal error already latched");
            return false;
        }
        state.terminal_error = Some(Arc::new(err));
        true
    }

    /// Idempotent. Returns `true` for the call that actually closed the session.
    pub(crate) fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.reconnect_enabled = false;
        }
        self.cancel.cancel();
        true
    }

    /// Latch [`ClientError::StreamCancelled`] for a cancellation that did not
    /// come from [`close`](Self::close). Returns `false` when the session had
    /// already been closed or had finished on its own.
    pub(crate) fn cancelled(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.phase == SessionPhase::Closed {
            return false;
        }
        state.reconnect_enabled = false;
        if state.terminal_error.is_none() {
            state.terminal_error = Some(Arc::new(ClientError::StreamCancelled));
        }
        true
    }

    pub(crate) fn is_sentinel(&self, data: &str) -> bool {
        self.sentinel
            .as_deref()
            .is_some_and(|sentinel| data.trim() == sentinel)
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.state.lock().phase = phase;
    }
}

/// Consumer side of a session's event queue.
///
/// Finite and not restartable. Ends as soon as the session is closed or
/// cancelled, even if events are still queued. Once it has ended,
/// [`Session::error`] no longer changes.
pub struct SessionEvents {
    rx: Option<mpsc::Receiver<ProtocolEvent>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    shared: Arc<Shared>,
}

impl SessionEvents {
    fn new(rx: Option<mpsc::Receiver<ProtocolEvent>>, shared: Arc<Shared>) -> Self {
        Self {
            rx,
            cancelled: Box::pin(shared.cancel.clone().cancelled_owned()),
            shared,
        }
    }

    /// Receive the next event, or `None` once the sequence is exhausted.
    pub async fn next_event(&mut self) -> Option<ProtocolEvent> {
        self.next().await
    }

    /// Stop consuming; later polls return `None`.
    pub(crate) fn terminate(&mut self) {
        self.rx = None;
    }
}

impl Stream for SessionEvents {
    type Item = ProtocolEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.rx = None;
            if this.shared.cancelled() {
                debug!("event sequence ended by cancellation");
            }
            return Poll::Ready(None);
        }
        match rx.poll_recv(cx) {
            Poll::Ready(None) => {
                this.rx = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// One streaming subscription.
///
/// Created by [`open_stream`] (or [`Client::open_stream`](crate::client::Client::open_stream)).
pub struct Session {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::Receiver<ProtocolEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// The event sequence. Only the first call yields events.
    pub fn events(&self) -> SessionEvents {
        SessionEvents::new(self.events.lock().take(), Arc::clone(&self.shared))
    }

    /// Decode every event payload as JSON into `T`.
    pub fn typed<T: DeserializeOwned>(&self) -> TypedStream<T> {
        TypedStream::new(self.events(), Arc::clone(&self.shared))
    }

    /// The terminal error, if the session failed.
    ///
    /// Stable once the event sequence has been exhausted.
    pub fn error(&self) -> Option<Arc<ClientError>> {
        self.shared.state.lock().terminal_error.clone()
    }

    /// Stop the session. Safe to call repeatedly and from any task.
    pub fn close(&self) {
        if self.shared.close() {
            info!("stream session closed by caller");
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.state.lock().phase
    }

    /// Reconnections since the last successfully decoded event.
    pub fn retry_attempt(&self) -> u32 {
        self.shared.state.lock().retry_attempt
    }

    /// Connections opened so far, the initial one included.
    pub fn connections(&self) -> u64 {
        self.shared.state.lock().connections
    }

    pub fn is_closed(&self) -> bool {
        let state = self.shared.state.lock();
        state.closed || state.phase == SessionPhase::Closed
    }

    /// Token whose cancellation aborts the session with
    /// [`ClientError::StreamCancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Wait until the background task has released its connection and exited.
    pub async fn finished(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "stream task failed");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.shared.state.lock())
            .finish_non_exhaustive()
    }
}

/// Open a session: connect once, then hand the connection to a reader task.
///
/// Fails without spawning anything when the first connection cannot be
/// established or the server rejects the request.
pub async fn open_stream<T: Transport>(
    transport: Arc<T>,
    request: ApiRequest,
    options: StreamOptions,
    cancel: CancellationToken,
) -> Result<Session, ClientError> {
    options.validate()?;
    let token = cancel.child_token();

    info!(method = %request.method, url = %request.url, "opening stream");
    let connection = match &options.connect_retry {
        Some(config) => {
            retry::execute(|| connect(transport.as_ref(), &request, &token), config, &token).await
        }
        None => connect(transport.as_ref(), &request, &token).await,
    };
    let connection = connection.inspect_err(|err| {
        error!(url = %request.url, error = %err, "stream connection failed");
    })?;

    let (tx, rx) = mpsc::channel(options.channel_capacity);
    let shared = Arc::new(Shared::new(token, options.sentinel.clone()));
    let driver = Driver {
        transport,
        request,
        options,
        shared: Arc::clone(&shared),
        tx,
    };
    let task = tokio::spawn(driver.run(connection));

    Ok(Session {
        shared,
        events: Mutex::new(Some(rx)),
        task: Mutex::new(Some(task)),
    })
}

async fn connect<T: Transport + ?Sized>(
    transport: &T,
    request: &ApiRequest,
    cancel: &CancellationToken,
) -> Result<ByteStream, ClientError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::StreamCancelled),
        result = transport.connect(request) => result,
    }
}

enum ReadOutcome {
    Sentinel,
    Ended,
    Failed(ClientError),
    Cancelled,
    ConsumerGone,
}

/// Producer half of a session, run on its own task.
struct Driver<T> {
    transport: Arc<T>,
    request: ApiRequest,
    options: StreamOptions,
    shared: Arc<Shared>,
    tx: mpsc::Sender<ProtocolEvent>,
}

impl<T: Transport> Driver<T> {
    async fn run(self, connection: ByteStream) {
        let mut connection = Some(connection);

        while let Some(stream) = connection.take() {
            let mut parser = EventStreamParser::new(stream);
            self.shared.set_phase(SessionPhase::Reading);
            let outcome = self.read(&mut parser).await;
            let retry_hint = parser.retry_hint();
            drop(parser);
            debug!(url = %self.request.url, "connection released");

            let err = match outcome {
                ReadOutcome::Sentinel => {
                    info!(url = %self.request.url, "stream finished");
                    break;
                }
                ReadOutcome::Ended if !self.options.reconnect_on_eof => {
                    info!(url = %self.request.url, "stream ended by server");
                    break;
                }
                ReadOutcome::Ended => {
                    ClientError::TransportRead("stream ended before completion".to_string())
                }
                ReadOutcome::Failed(err) => err,
                ReadOutcome::Cancelled => {
                    self.on_cancelled();
                    break;
                }
                ReadOutcome::ConsumerGone => {
                    debug!("stream consumer dropped");
                    break;
                }
            };

            connection = self.reconnect(err, retry_hint).await;
        }

        self.finish();
    }

    async fn read(&self, parser: &mut EventStreamParser<ByteStream>) -> ReadOutcome {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return ReadOutcome::Cancelled,
                _ = self.tx.closed() => return ReadOutcome::ConsumerGone,
                next = next_event(parser, self.options.idle_timeout) => next,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => return ReadOutcome::Ended,
                Err(err) => return ReadOutcome::Failed(err),
            };

            self.shared.state.lock().retry_attempt = 0;
            let sentinel = self.shared.is_sentinel(&event.data);
            debug!(
                event_type = %event.event,
                id = %event.id,
                bytes = event.data.len(),
                "event received"
            );

            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return ReadOutcome::Cancelled,
                sent = self.tx.send(event) => {
                    if sent.is_err() {
                        return ReadOutcome::ConsumerGone;
                    }
                }
            }

            if sentinel {
                return ReadOutcome::Sentinel;
            }
        }
    }

    /// Reconnect after `err`, or latch the error when the budget is spent.
    ///
    /// Returns the new connection, or `None` when the session must close.
    async fn reconnect(
        &self,
        mut err: ClientError,
        retry_hint: Option<Duration>,
    ) -> Option<ByteStream> {
        loop {
            let attempt = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return None;
                }
                if !state.reconnect_enabled
                    || state.retry_attempt >= self.options.max_reconnect_attempts
                {
                    drop(state);
                    error!(
                        url = %self.request.url,
                        attempts = self.options.max_reconnect_attempts,
                        error = %err,
                        "stream failed, giving up"
                    );
                    self.shared.latch_error(err);
                    return None;
                }
                state.retry_attempt += 1;
                state.phase = SessionPhase::Reconnecting {
                    attempt: state.retry_attempt,
                };
                state.retry_attempt
            };

            let delay = self.options.reconnect_delay(attempt, retry_hint);
            warn!(
                url = %self.request.url,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "stream interrupted, reconnecting after backoff"
            );

            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => {
                    self.on_cancelled();
                    return None;
                }
                _ = self.tx.closed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            self.shared.set_phase(SessionPhase::Connecting);
            match connect(self.transport.as_ref(), &self.request, &self.shared.cancel).await {
                Ok(stream) => {
                    let mut state = self.shared.state.lock();
                    if state.closed {
                        return None;
                    }
                    state.connections += 1;
                    info!(url = %self.request.url, attempt, "stream reconnected");
                    return Some(stream);
                }
                Err(ClientError::StreamCancelled) => {
                    self.on_cancelled();
                    return None;
                }
                Err(rejected) if rejected.is_rejection() => {
                    error!(url = %self.request.url, error = %rejected, "reconnection rejected");
                    self.shared.latch_error(rejected);
                    return None;
                }
                Err(next) => err = next,
            }
        }
    }

    fn on_cancelled(&self) {
        if self.shared.cancelled() {
            warn!(url = %self.request.url, "stream cancelled");
        } else {
            debug!(url = %self.request.url, "stream stopped after close");
        }
    }

    fn finish(self) {
        {
            let mut state = self.shared.state.lock();
            state.phase = SessionPhase::Closed;
            state.reconnect_enabled = false;
        }
        debug!(url = %self.request.url, "stream task exiting");
        drop(self.tx);
    }
}

async fn next_event(
    parser: &mut EventStreamParser<ByteStream>,
    idle_timeout: Option<Duration>,
) -> Result<Option<ProtocolEvent>, ClientError> {
    let result = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, parser.next())
            .await
            .map_err(|_| ClientError::TransportRead(format!("no data received for {limit:?}")))?,
        None => parser.next().await,
    };
    Ok(result?)
}
