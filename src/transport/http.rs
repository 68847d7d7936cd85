//! HTTP and streamable HTTP transports
//!
//! Every outbound message is one POST. Plain `http` expects a JSON body (or
//! nothing for notifications). `streamable-http` additionally:
//! - accepts `text/event-stream` responses, parsed as they arrive
//! - tracks the `Mcp-Session-Id` header assigned by the server
//! - DELETEs the session on close

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::sse::{SseParser, deliver};
use super::{CloseReason, Inbox, Transport, TransportKind, debug as wire, decode_payload};
use crate::protocol::{JsonRpcMessage, PROTOCOL_VERSION};
use crate::{Error, Result};

const SESSION_HEADER: &str = "mcp-session-id";

/// HTTP transport (plain or streamable)
pub struct HttpTransport {
    client: Client,
    url: Url,
    headers: HeaderMap,
    streamable: bool,
    debug: bool,
    session_id: RwLock<Option<String>>,
    inbox: Arc<Inbox>,
    cancel: CancellationToken,
}

impl HttpTransport {
    /// Create a transport. No request is made until the first `send`.
    #[must_use]
    pub fn new(
        client: Client,
        url: Url,
        headers: HeaderMap,
        streamable: bool,
        debug: bool,
    ) -> Arc<Self> {
        debug!(url = %url, streamable, "HTTP transport created");
        Arc::new(Self {
            client,
            url,
            headers,
            streamable,
            debug,
            session_id: RwLock::new(None),
            inbox: Inbox::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Session id assigned by a streamable server
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(if self.streamable {
                "application/json, text/event-stream"
            } else {
                "application/json"
            }),
        );
        headers.insert(
            "MCP-Protocol-Version",
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        if self.streamable {
            if let Some(id) = self.session_id.read().as_deref() {
                if let Ok(value) = HeaderValue::from_str(id) {
                    headers.insert(SESSION_HEADER, value);
                }
            }
        }
        headers
    }

    fn remember_session(&self, response_headers: &HeaderMap) {
        if !self.streamable {
            return;
        }
        let Some(id) = response_headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut slot = self.session_id.write();
        if slot.as_deref() != Some(id) {
            info!(session_id = %id, url = %self.url, "Stored session ID from response");
            *slot = Some(id.to_string());
        }
    }

    /// Queue every message in a JSON body. Non-JSON bodies (some servers
    /// answer notifications with plain text) are ignored.
    async fn push_all(&self, body: &[u8], content_type: &str) -> Result<()> {
        let messages = match decode_payload(body) {
            Ok(messages) => messages,
            Err(e) if content_type.contains("json") => return Err(e),
            Err(_) => {
                debug!(url = %self.url, content_type, "Ignoring non-JSON response body");
                return Ok(());
            }
        };
        for message in messages {
            self.inbox.push(message).await?;
        }
        Ok(())
    }

    /// Parse an event-stream body chunk by chunk, delivering as it arrives
    async fn consume_stream(&self, response: Response) -> Result<()> {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return Err(self.inbox.closed_error()),
                next = stream.next() => next,
            };
            let (events, done) = match next {
                Some(chunk) => (parser.push(&chunk?), false),
                None => (parser.finish().into_iter().collect(), true),
            };
            for event in events.iter().filter(|e| e.event == "message") {
                if !deliver(&self.inbox, event).await {
                    return Err(self.inbox.closed_error());
                }
            }
            if done {
                return Ok(());
            }
        }
    }

    async fn handle_response(&self, response: Response) -> Result<()> {
        let status = response.status();
        self.remember_session(response.headers());

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if !status.is_success() {
            let body = if self.debug {
                String::from_utf8_lossy(&wire::buffer(response).await?).into_owned()
            } else {
                response.text().await.unwrap_or_default()
            };
            if status == StatusCode::NOT_FOUND && self.session_id.read().is_some() {
                warn!(url = %self.url, "Server no longer recognises the session");
            }
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: wire::truncate(&body, 512),
            });
        }

        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let event_stream = content_type.starts_with("text/event-stream");
        if event_stream && !self.streamable {
            return Err(Error::Protocol(
                "server answered with an event stream; use the streamable-http transport"
                    .to_string(),
            ));
        }

        if self.debug {
            let body = wire::buffer(response).await?;
            if event_stream {
                let mut parser = SseParser::new();
                let mut events = parser.push(&body);
                events.extend(parser.finish());
                for event in events.iter().filter(|e| e.event == "message") {
                    if !deliver(&self.inbox, event).await {
                        return Err(self.inbox.closed_error());
                    }
                }
                return Ok(());
            }
            return self.push_all(&body, &content_type).await;
        }

        if event_stream {
            return self.consume_stream(response).await;
        }

        let body = response.bytes().await?;
        self.push_all(&body, &content_type).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.inbox.is_closed() {
            return Err(self.inbox.closed_error());
        }

        let body = serde_json::to_vec(&message)?;
        if self.debug {
            wire::log_request(&Method::POST, &self.url, Some(&body));
        }

        let request = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers())
            .body(body);

        let response = tokio::select! {
            () = self.cancel.cancelled() => return Err(self.inbox.closed_error()),
            response = request.send() => response?,
        };

        self.handle_response(response).await
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

        let session_id = self.session_id.write().take();
        if let Some(id) = session_id {
            if self.debug {
                wire::log_request(&Method::DELETE, &self.url, None);
            }
            let result = self
                .client
                .delete(self.url.clone())
                .headers(self.headers.clone())
                .header(SESSION_HEADER, id.as_str())
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match result {
                Ok(response) => {
                    debug!(session_id = %id, status = response.status().as_u16(), "Session terminated");
                }
                Err(e) => debug!(session_id = %id, error = %e, "Session DELETE failed"),
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.inbox.is_closed()
    }

    fn kind(&self) -> TransportKind {
        if self.streamable {
            TransportKind::StreamableHttp
        } else {
            TransportKind::Http
        }
    }
}
