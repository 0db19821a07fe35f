//! Scripted transport used by the unit tests.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::client::ClientError;
use crate::http::{api_error, ApiRequest, ByteStream, Transport};

#[derive(Debug, Clone)]
pub enum Step {
    Data(&'static str),
    Bytes(&'static [u8]),
    Fail(&'static str),
    /// Never yields; the connection stays open until dropped.
    Pending,
}

/// What one `connect` call does.
#[derive(Debug, Clone)]
pub enum Script {
    Refuse(&'static str),
    Reject(u16),
    /// The connect call never completes.
    Hang,
    Stream(Vec<Step>),
}

impl Script {
    pub fn stream(steps: impl IntoIterator<Item = Step>) -> Self {
        Script::Stream(steps.into_iter().collect())
    }
}

/// Replays one script per connection; `fallback` serves once they run out.
#[derive(Debug)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Option<Script>,
    pub connects: AtomicUsize,
    pub releases: Arc<AtomicUsize>,
    pub polls: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Self::build(scripts, None)
    }

    pub fn with_fallback(scripts: Vec<Script>, fallback: Script) -> Arc<Self> {
        Self::build(scripts, Some(fallback))
    }

    fn build(scripts: Vec<Script>, fallback: Option<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            connects: AtomicUsize::new(0),
            releases: Arc::default(),
            polls: Arc::default(),
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _request: &ApiRequest) -> Result<ByteStream, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().pop_front().or_else(|| self.fallback.clone());
        match script {
            None => Err(ClientError::Connection("script exhausted".to_string())),
            Some(Script::Refuse(message)) => Err(ClientError::Connection(message.to_string())),
            Some(Script::Reject(code)) => {
                let status = StatusCode::from_u16(code)
                    .map_err(|err| ClientError::Config(err.to_string()))?;
                Err(api_error(status, ""))
            }
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Stream(steps)) => Ok(Box::pin(ScriptedStream {
                steps: steps.into(),
                releases: Arc::clone(&self.releases),
                polls: Arc::clone(&self.polls),
            })),
        }
    }
}

struct ScriptedStream {
    steps: VecDeque<Step>,
    releases: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
}

impl Stream for ScriptedStream {
    type Item = Result<Bytes, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        match self.steps.front() {
            Some(Step::Pending) => Poll::Pending,
            _ => Poll::Ready(self.steps.pop_front().map(|step| match step {
                Step::Data(text) => Ok(Bytes::from_static(text.as_bytes())),
                Step::Bytes(raw) => Ok(Bytes::from_static(raw)),
                Step::Fail(message) => Err(ClientError::TransportRead(message.to_string())),
                Step::Pending => unreachable!(),
            })),
        }
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
