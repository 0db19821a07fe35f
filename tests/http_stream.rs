use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use streamwire::options::{HttpTransport, TransportOptions};
use streamwire::sse::SSEResponseExt;
use streamwire::{ApiRequest, Backoff, Client, ClientError, RetryConfig, StreamOptions};

/// Minimal HTTP/1.1 server answering each connection with the next canned
/// response and closing it afterwards.
struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl TestServer {
    async fn start(responses: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let server_hits = Arc::clone(&hits);
        let server_requests = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let index = server_hits.fetch_add(1, Ordering::SeqCst);
                let response = responses
                    .get(index)
                    .or_else(|| responses.last())
                    .cloned()
                    .unwrap_or_default();
                let requests = Arc::clone(&server_requests);
                tokio::spawn(async move {
                    let head = read_head(&mut socket).await;
                    requests.lock().push(head);
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            base_url,
            hits,
            requests,
        }
    }

    fn client(&self) -> Client {
        Client::new(
            TransportOptions::new(
                HttpTransport::new("test-key").with_base_url(self.base_url.clone()),
            )
            .with_timeout(Duration::from_secs(5)),
        )
        .unwrap()
    }
}

async fn read_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn event_stream(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{body}"
    )
}

fn json_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn fast_reconnects() -> StreamOptions {
    StreamOptions::default().with_reconnect_backoff(
        Backoff::new(Duration::from_millis(1), Duration::from_millis(5)).without_jitter(),
    )
}

#[tokio::test]
async fn streams_events_end_to_end() {
    let server = TestServer::start(vec![event_stream(
        ": keep-alive\n\nid: 1\nevent: delta\ndata: {\"text\":\"hel\"}\n\ndata: {\"text\":\"lo\"}\r\n\r\ndata: [DONE]\n\n",
    )])
    .await;

    let session = server
        .client()
        .open_stream(ApiRequest::get("/v1/stream"))
        .await
        .unwrap();
    let events = tokio::time::timeout(
        Duration::from_secs(5),
        session.events().collect::<Vec<_>>(),
    )
    .await
    .unwrap();

    let data: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(data, vec!["{\"text\":\"hel\"}", "{\"text\":\"lo\"}", "[DONE]"]);
    assert_eq!(events[0].id, "1");
    assert_eq!(events[0].event, "delta");
    assert!(session.error().is_none());

    let head = server.requests.lock()[0].to_lowercase();
    assert!(head.starts_with("get /v1/stream http/1.1"));
    assert!(head.contains("accept: text/event-stream"));
    assert!(head.contains("authorization: bearer test-key"));
}

#[tokio::test]
async fn typed_stream_over_http() {
    #[derive(Debug, Deserialize)]
    struct Delta {
        text: String,
    }

    let server = TestServer::start(vec![event_stream(
        "data: {\"text\":\"a\"}\n\ndata: {\"text\":\"b\"}\n\ndata: [DONE]\n\n",
    )])
    .await;

    let session = server
        .client()
        .open_stream(ApiRequest::get("/v1/stream"))
        .await
        .unwrap();
    let text: String = session
        .typed::<Delta>()
        .map(|delta| delta.text)
        .collect::<Vec<_>>()
        .await
        .concat();

    assert_eq!(text, "ab");
    assert!(session.error().is_none());
}

#[tokio::test]
async fn reconnects_after_server_drops_connection() {
    let server = TestServer::start(vec![
        event_stream("data: first\n\n"),
        event_stream("data: second\n\ndata: [DONE]\n\n"),
    ])
    .await;

    let client = server
        .client()
        .with_stream_options(fast_reconnects().with_reconnect_on_eof(true));
    let session = client
        .open_stream(ApiRequest::get("/v1/stream"))
        .await
        .unwrap();
    let data: Vec<_> = session.events().map(|e| e.data).collect().await;

    assert_eq!(data, vec!["first", "second", "[DONE]"]);
    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    assert!(session.error().is_none());
}

#[tokio::test]
async fn rejected_stream_reports_api_error() {
    let server = TestServer::start(vec![json_response(
        "401 Unauthorized",
        r#"{"error":{"message":"Invalid API key","type":"authentication_error"}}"#,
    )])
    .await;

    let err = server
        .client()
        .open_stream(ApiRequest::get("/v1/stream"))
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    assert!(err.to_string().contains("Invalid API key"));
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_json_retries_unavailable() {
    #[derive(Debug, Deserialize)]
    struct Status {
        ok: bool,
    }

    let server = TestServer::start(vec![
        json_response("503 Service Unavailable", r#"{"error":{"message":"busy"}}"#),
        json_response("200 OK", r#"{"ok":true}"#),
    ])
    .await;

    let client = server.client().with_retry(
        RetryConfig::with_retries(2)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(0.0),
    );
    let status: Status = client
        .request_json(&ApiRequest::get("/v1/status"))
        .await
        .unwrap();

    assert!(status.ok);
    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn request_json_does_not_retry_client_errors() {
    let server = TestServer::start(vec![json_response(
        "404 Not Found",
        r#"{"error":{"message":"no such thing"}}"#,
    )])
    .await;

    let result: Result<serde_json::Value, ClientError> = server
        .client()
        .request_json(&ApiRequest::get("/v1/missing"))
        .await;

    assert_eq!(result.unwrap_err().status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sse_response_extension() {
    let server = TestServer::start(vec![event_stream("data: one\n\ndata: two\n\n")]).await;

    let response = reqwest::get(format!("{}/raw", server.base_url))
        .await
        .unwrap();
    let events: Vec<_> = response.sse().collect().await;

    let data: Vec<_> = events.into_iter().map(|e| e.unwrap().data).collect();
    assert_eq!(data, vec!["one", "two"]);
}
