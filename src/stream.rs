//! Typed view over a session's events.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::client::ClientError;
use crate::session::{SessionEvents, Shared};

/// Stream of event payloads decoded as JSON into `T`.
///
/// The end-of-stream sentinel and events without data (such as a bare
/// `event: ping` block) are skipped. A payload that fails to decode latches
/// [`ClientError::Decode`] on the session, closes it and ends this stream.
pub struct TypedStream<T> {
    events: SessionEvents,
    shared: Arc<Shared>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedStream<T> {
    pub(crate) fn new(events: SessionEvents, shared: Arc<Shared>) -> Self {
        Self {
            events,
            shared,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Stream for TypedStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        loop {
            let event = match Pin::new(&mut this.events).poll_next(cx) {
                Poll::Ready(Some(event)) => event,
                other => return other.map(|_| None),
            };
            if event.data.is_empty() || this.shared.is_sentinel(&event.data) {
                continue;
            }

            match serde_json::from_str::<T>(&event.data) {
                Ok(value) => return Poll::Ready(Some(value)),
                Err(err) => {
                    warn!(error = %err, event_type = %event.event, "failed to decode event payload");
                    this.shared.latch_error(ClientError::Decode(err));
                    this.shared.close();
                    this.events.terminate();
                    return Poll::Ready(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use serde::Deserialize;
    use tokio_util::sync::CancellationToken;

    use crate::http::ApiRequest;
    use crate::options::StreamOptions;
    use crate::session::{open_stream, Session};
    use crate::test_support::{Script, ScriptedTransport, Step};
    use crate::ClientError;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Chunk {
        text: String,
    }

    async fn session(steps: Vec<Step>) -> Session {
        open_stream(
            ScriptedTransport::new(vec![Script::stream(steps)]),
            ApiRequest::get("http://localhost/stream"),
            StreamOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect("open stream")
    }

    #[tokio::test]
    async fn test_decodes_payloads_and_skips_sentinel() {
        let session = session(vec![
            Step::Data("data: {\"text\":\"a\"}\n\n"),
            Step::Data("data: {\"text\":\"b\"}\n\ndata: [DONE]\n\n"),
        ])
        .await;

        let chunks: Vec<Chunk> = tokio::time::timeout(
            Duration::from_secs(5),
            session.typed::<Chunk>().collect::<Vec<_>>(),
        )
        .await
        .unwrap();

        assert_eq!(
            chunks,
            vec![Chunk { text: "a".into() }, Chunk { text: "b".into() }]
        );
        session.finished().await;
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn test_skips_events_without_data() {
        let session = session(vec![
            Step::Data("event: ping\n\n"),
            Step::Data("id: 7\n\ndata: {\"text\":\"a\"}\n\n"),
            Step::Data("data: [DONE]\n\n"),
        ])
        .await;

        let chunks: Vec<Chunk> = tokio::time::timeout(
            Duration::from_secs(5),
            session.typed::<Chunk>().collect::<Vec<_>>(),
        )
        .await
        .unwrap();

        assert_eq!(chunks, vec![Chunk { text: "a".into() }]);
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn test_decode_failure_closes_session() {
        let session = session(vec![
            Step::Data("data: {\"text\":\"ok\"}\n\n"),
            Step::Data("data: not json\n\n"),
            Step::Pending,
        ])
        .await;

        let mut typed = session.typed::<Chunk>();
        assert_eq!(typed.next().await, Some(Chunk { text: "ok".into() }));
        assert_eq!(typed.next().await, None);
        assert_eq!(typed.next().await, None);

        session.finished().await;
        assert!(session.is_closed());
        let err = session.error().expect("decode error");
        assert!(matches!(*err, ClientError::Decode(_)));
    }
}
