//! Server-Sent Events transport
//!
//! 1. GET the stream URL and keep the response open
//! 2. The first `endpoint` event names the POST URL (relative to the stream)
//! 3. Outbound messages are POSTed there; replies arrive as `message` events

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, Response};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{CloseReason, Inbox, Transport, TransportKind, debug as wire, decode_payload};
use crate::protocol::{JsonRpcMessage, PROTOCOL_VERSION};
use crate::{Error, Result};

/// One dispatched event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type, `message` when the stream did not name one
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
    /// Last event id seen on the stream
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser.
///
/// Feed arbitrary byte chunks; complete events come out. Handles multi-line
/// `data`, CRLF line endings, comments and chunk boundaries inside UTF-8
/// sequences.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    /// Create a parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every event it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush at end of stream: a trailing unterminated line and any pending
    /// event are dispatched.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.buf)).into_owned();
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.clone(),
        })
    }
}

/// Resolve a possibly relative endpoint against the stream URL
fn resolve_endpoint(base: &Url, endpoint: &str) -> Result<Url> {
    let url = base
        .join(endpoint.trim())
        .map_err(|e| Error::Protocol(format!("invalid endpoint '{endpoint}': {e}")))?;
    let same_origin = url.scheme() == base.scheme()
        && url.host_str() == base.host_str()
        && url.port_or_known_default() == base.port_or_known_default();
    if !same_origin {
        return Err(Error::Protocol(format!(
            "endpoint {url} is not on the stream origin {}",
            base.origin().ascii_serialization()
        )));
    }
    Ok(url)
}

/// Deliver `message` events from a body to the inbox; returns false once
/// the inbox refuses further messages
pub(crate) async fn deliver(inbox: &Inbox, event: &SseEvent) -> bool {
    match decode_payload(event.data.as_bytes()) {
        Ok(messages) => {
            for message in messages {
                if inbox.push(message).await.is_err() {
                    return false;
                }
            }
        }
        Err(e) => warn!(error = %e, "Dropping undecodable event payload"),
    }
    true
}

/// SSE transport
pub struct SseTransport {
    client: Client,
    stream_url: Url,
    endpoint: Url,
    headers: HeaderMap,
    inbox: Arc<Inbox>,
    cancel: CancellationToken,
    request_timeout: Duration,
    debug: bool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    ///
    /// The whole handshake shares one `connect_timeout` budget.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` when no endpoint arrives in time, `Error::HttpStatus`
    /// for a failed GET, `Error::Http` for network failures, `Error::Protocol`
    /// when the endpoint is malformed or off the stream's origin.
    pub async fn connect(
        client: Client,
        url: Url,
        headers: HeaderMap,
        connect_timeout: Duration,
        request_timeout: Duration,
        debug: bool,
    ) -> Result<Arc<Self>> {
        let deadline = Instant::now() + connect_timeout;

        let mut stream_headers = headers.clone();
        stream_headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        stream_headers.insert(
            "MCP-Protocol-Version",
            HeaderValue::from_static(PROTOCOL_VERSION),
        );

        if debug {
            wire::log_request(&Method::GET, &url, None);
        }
        debug!(url = %url, "Opening event stream");

        let response = tokio::time::timeout_at(
            deadline,
            client.get(url.clone()).headers(stream_headers).send(),
        )
        .await
        .map_err(|_| Error::Timeout(connect_timeout))??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: wire::truncate(&body, 512),
            });
        }

        let inbox = Inbox::new();
        let cancel = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_stream(
            response,
            url.clone(),
            Arc::clone(&inbox),
            cancel.clone(),
            endpoint_tx,
        ));
        // Stops the reader if this future fails or is dropped before the endpoint arrives
        let stop_reader = cancel.clone().drop_guard();

        let endpoint = match tokio::time::timeout_at(deadline, endpoint_rx).await {
            Ok(Ok(Ok(endpoint))) => endpoint,
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => {
                return Err(Error::Transport(
                    "event stream ended before the endpoint event".to_string(),
                ));
            }
            Err(_) => return Err(Error::Timeout(connect_timeout)),
        };
        let _ = stop_reader.disarm();

        info!(stream_url = %url, endpoint = %endpoint, "SSE handshake complete");

        Ok(Arc::new(Self {
            client,
            stream_url: url,
            endpoint,
            headers,
            inbox,
            cancel,
            request_timeout,
            debug,
            reader: Mutex::new(Some(reader)),
        }))
    }

    /// POST URL announced by the server
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, body: Vec<u8>) -> Result<Response> {
        if self.debug {
            wire::log_request(&Method::POST, &self.endpoint, Some(&body));
        }
        let request = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .timeout(self.request_timeout)
            .body(body);

        tokio::select! {
            () = self.cancel.cancelled() => Err(self.inbox.closed_error()),
            response = request.send() => Ok(response?),
        }
    }
}

async fn read_stream(
    response: Response,
    base: Url,
    inbox: Arc<Inbox>,
    cancel: CancellationToken,
    endpoint_tx: oneshot::Sender<Result<Url>>,
) {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new();
    let mut endpoint_tx = Some(endpoint_tx);

    let reason = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break "event stream closed".to_string(),
            next = stream.next() => next,
        };
        let events = match next {
            Some(Ok(chunk)) => parser.push(&chunk),
            Some(Err(e)) => break format!("event stream failed: {e}"),
            None => {
                let tail: Vec<_> = parser.finish().into_iter().collect();
                for event in &tail {
                    handle_event(event, &base, &inbox, &mut endpoint_tx).await;
                }
                break "event stream ended".to_string();
            }
        };
        for event in &events {
            if !handle_event(event, &base, &inbox, &mut endpoint_tx).await {
                return;
            }
        }
    };

    debug!(url = %base, reason = %reason, "Event stream reader stopped");
    inbox.close(CloseReason::Other(reason));
}

async fn handle_event(
    event: &SseEvent,
    base: &Url,
    inbox: &Inbox,
    endpoint_tx: &mut Option<oneshot::Sender<Result<Url>>>,
) -> bool {
    match event.event.as_str() {
        "endpoint" => match resolve_endpoint(base, &event.data) {
            Ok(endpoint) => match endpoint_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Ok(endpoint));
                }
                None => debug!(endpoint = %endpoint, "Ignoring repeated endpoint event"),
            },
            Err(e) => {
                warn!(error = %e, "Bad endpoint event");
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(Err(e));
                }
            }
        },
        "message" => return deliver(inbox, event).await,
        other => debug!(event = other, "Ignoring event"),
    }
    true
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.inbox.is_closed() {
            return Err(self.inbox.closed_error());
        }
        let body = serde_json::to_vec(&message)?;
        let response = self.post(body).await?;

        let status = response.status();
        let body = if self.debug {
            wire::buffer(response).await?
        } else {
            response.bytes().await?
        };
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: wire::truncate(&String::from_utf8_lossy(&body), 512),
            });
        }

        // Usually "Accepted"; a few servers answer inline instead of on the stream
        if let Ok(messages) = decode_payload(&body) {
            for message in messages {
                self.inbox.push(message).await?;
            }
        }
        Ok(())
    }

    async fn receive(&self, deadline: Option<Duration>) -> Result<JsonRpcMessage> {
        self.inbox.recv(deadline).await
    }

    async fn close(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();
        self.inbox
            .close(CloseReason::Other("transport closed".to_string()));
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }
        debug!(url = %self.stream_url, "SSE transport closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.inbox.is_closed()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_and_default_events() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: endpoint\ndata: /messages?session_id=1\n\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?session_id=1");
        assert_eq!(events[1].event, "message");
    }

    #[test]
    fn joins_multiline_data_and_handles_crlf() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keepalive\r\nid: 7\r\ndata: line1\r\ndata: line2\r\n\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "message".into(),
                data: "line1\nline2".into(),
                id: Some("7".into()),
            }]
        );
    }

    #[test]
    fn events_split_across_chunks() {
        let mut parser = SseParser::new();
        let text = "data: caf\u{e9}\n\n".as_bytes();
        // split inside the two-byte UTF-8 sequence
        let split = text.len() - 3;
        assert!(parser.push(&text[..split]).is_empty());
        let events = parser.push(&text[split..]);
        assert_eq!(events[0].data, "café");
    }

    #[test]
    fn finish_flushes_pending_event() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: message\ndata: tail").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn comment_only_and_empty_events_are_not_dispatched() {
        let mut parser = SseParser::new();
        assert!(parser.push(b": ping\n\nevent: noop\n\n").is_empty());
    }

    #[test]
    fn endpoint_resolution() {
        let base = Url::parse("http://localhost:8080/mcp/sse").unwrap();
        assert_eq!(
            resolve_endpoint(&base, "/messages?session_id=abc").unwrap().as_str(),
            "http://localhost:8080/messages?session_id=abc"
        );
        assert_eq!(
            resolve_endpoint(&base, "messages").unwrap().as_str(),
            "http://localhost:8080/mcp/messages"
        );
        assert_eq!(
            resolve_endpoint(&base, "http://localhost:8080/post").unwrap().as_str(),
            "http://localhost:8080/post"
        );

        // Messages never leave the stream's origin
        for foreign in [
            "https://other.example/post",
            "//other.example/post",
            "https://localhost:8080/post",
            "http://localhost:9090/post",
        ] {
            let err = resolve_endpoint(&base, foreign).unwrap_err();
            assert!(matches!(err, Error::Protocol(_)), "{foreign} gave {err}");
        }
    }
}
