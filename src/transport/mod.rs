//! Transport implementations for MCP servers
//!
//! Every transport kind is reduced to the same message channel: `send` one
//! JSON-RPC message, `receive` the next inbound one, `close` idempotently.
//! Request/response correlation lives one layer up in
//! [`ProtocolClient`](crate::client::ProtocolClient).

mod codec;
mod debug;
mod http;
mod sse;
mod stdio;

pub use self::codec::JsonRpcCodec;
pub use self::http::HttpTransport;
pub use self::sse::{SseEvent, SseParser, SseTransport};
pub use self::stdio::StdioTransport;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::TransportSettings;
use crate::process::{ProcessManager, ProcessSpec};
use crate::protocol::JsonRpcMessage;
use crate::{Error, Result};

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message to the server
    async fn send(&self, message: JsonRpcMessage) -> Result<()>;

    /// Next inbound message, waiting at most `deadline` when given.
    ///
    /// Messages queued before the transport closed are still delivered;
    /// afterwards the close reason is returned as an error.
    async fn receive(&self, deadline: Option<Duration>) -> Result<JsonRpcMessage>;

    /// Close the transport. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;

    /// Which kind of transport this is
    fn kind(&self) -> TransportKind;
}

/// Supported transport kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Child process over stdin/stdout
    Stdio,
    /// One POST per message
    Http,
    /// Long-lived event stream plus POST endpoint
    Sse,
    /// POST with optional event-stream responses and session header
    StreamableHttp,
}

impl TransportKind {
    /// Canonical name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }

    /// Network kinds take a URL, stdio takes a command
    #[must_use]
    pub fn is_network(self) -> bool {
        !matches!(self, Self::Stdio)
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            "streamable-http" => Ok(Self::StreamableHttp),
            _ => Err(Error::UnsupportedTransport(s.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Process { command: String, args: Vec<String> },
    Remote { url: Url, headers: Vec<(String, String)> },
}

/// Everything needed to open a transport. Validated at construction, so a
/// descriptor in hand always has a target consistent with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    kind: TransportKind,
    target: Target,
}

impl ConnectionDescriptor {
    /// Stdio descriptor
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty command. Dangerous patterns are
    /// checked by the process manager right before spawning.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Result<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(Error::Config("stdio transport requires a command".to_string()));
        }
        Ok(Self {
            kind: TransportKind::Stdio,
            target: Target::Process { command, args },
        })
    }

    /// Network descriptor (`http`, `sse`, `streamable-http`)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when `kind` is stdio, the URL does not parse,
    /// the scheme is not http/https, or a header is malformed.
    pub fn network(kind: TransportKind, url: &str, headers: Vec<(String, String)>) -> Result<Self> {
        if !kind.is_network() {
            return Err(Error::Config(format!("{kind} transport does not take a URL")));
        }
        let url = Url::parse(url).map_err(|e| Error::Config(format!("invalid URL '{url}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "URL scheme must be http or https, got '{}'",
                url.scheme()
            )));
        }
        header_map(&headers)?;
        Ok(Self {
            kind,
            target: Target::Remote { url, headers },
        })
    }

    /// Build from loosely typed parts (CLI flags, daemon params).
    ///
    /// Exactly one of `command`/`url` must be present, consistent with `kind`.
    ///
    /// # Errors
    ///
    /// `Error::UnsupportedTransport` for an unknown kind, `Error::Config` for a
    /// mismatched or invalid target.
    pub fn new(
        kind: &str,
        command: Option<String>,
        args: Vec<String>,
        url: Option<String>,
        headers: Vec<(String, String)>,
    ) -> Result<Self> {
        let kind: TransportKind = kind.parse()?;
        match (kind, command, url) {
            (TransportKind::Stdio, Some(command), None) => Self::stdio(command, args),
            (TransportKind::Stdio, _, _) => Err(Error::Config(
                "stdio transport requires a command and no URL".to_string(),
            )),
            (kind, None, Some(url)) => {
                if !args.is_empty() {
                    return Err(Error::Config(format!("{kind} transport does not take arguments")));
                }
                Self::network(kind, &url, headers)
            }
            (kind, _, _) => Err(Error::Config(format!(
                "{kind} transport requires a URL and no command"
            ))),
        }
    }

    /// Transport kind
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Command for stdio descriptors
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        match &self.target {
            Target::Process { command, .. } => Some(command),
            Target::Remote { .. } => None,
        }
    }

    /// Arguments for stdio descriptors
    #[must_use]
    pub fn args(&self) -> &[String] {
        match &self.target {
            Target::Process { args, .. } => args,
            Target::Remote { .. } => &[],
        }
    }

    /// URL for network descriptors
    #[must_use]
    pub fn url(&self) -> Option<&Url> {
        match &self.target {
            Target::Remote { url, .. } => Some(url),
            Target::Process { .. } => None,
        }
    }

    /// Extra request headers for network descriptors
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        match &self.target {
            Target::Remote { headers, .. } => headers,
            Target::Process { .. } => &[],
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Process { command, args } => {
                write!(f, "stdio:{command}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            // Header values may carry credentials; never print them
            Target::Remote { url, .. } => write!(f, "{}:{url}", self.kind),
        }
    }
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = key
            .parse::<HeaderName>()
            .map_err(|e| Error::Config(format!("invalid header name '{key}': {e}")))?;
        let value = value
            .parse::<HeaderValue>()
            .map_err(|e| Error::Config(format!("invalid value for header '{key}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// How cancellation and deadlines map onto a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStrategy {
    /// Cancelling kills the child process
    TerminateProcess,
    /// Cancelling aborts the in-flight HTTP request
    AbortRequest,
    /// Cancelling closes the event stream
    CloseStream,
}

impl ContextStrategy {
    /// Strategy for a transport kind
    #[must_use]
    pub fn for_kind(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Stdio => Self::TerminateProcess,
            TransportKind::Http | TransportKind::StreamableHttp => Self::AbortRequest,
            TransportKind::Sse => Self::CloseStream,
        }
    }

    /// Whether the per-request timeout applies to the underlying connection.
    /// A long-lived event stream must not be torn down by it.
    #[must_use]
    pub fn applies_request_timeout(self) -> bool {
        !matches!(self, Self::CloseStream)
    }
}

/// Creates transports from descriptors
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport for `descriptor`
    async fn create(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(Arc<dyn Transport>, ContextStrategy)>;
}

/// Factory for the four built-in transports
pub struct DefaultTransportFactory {
    process_manager: Arc<ProcessManager>,
    debug: bool,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl DefaultTransportFactory {
    /// Create a factory
    #[must_use]
    pub fn new(process_manager: Arc<ProcessManager>, settings: &TransportSettings) -> Self {
        Self {
            process_manager,
            debug: settings.debug,
            request_timeout: settings.request_timeout,
            connect_timeout: settings.connect_timeout,
        }
    }

    /// Process manager used for stdio transports
    #[must_use]
    pub fn process_manager(&self) -> &Arc<ProcessManager> {
        &self.process_manager
    }

    fn http_client(&self, overall_timeout: bool) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5));
        if overall_timeout {
            builder = builder.timeout(self.request_timeout);
        }
        builder
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(Arc<dyn Transport>, ContextStrategy)> {
        let kind = descriptor.kind();
        let strategy = ContextStrategy::for_kind(kind);

        let transport: Arc<dyn Transport> = match &descriptor.target {
            Target::Process { command, args } => {
                let spec = ProcessSpec::new(command.clone(), args.clone());
                StdioTransport::spawn(&self.process_manager, &spec)?
            }
            Target::Remote { url, headers } => {
                let headers = header_map(headers)?;
                match kind {
                    TransportKind::Sse => {
                        let client = self.http_client(strategy.applies_request_timeout())?;
                        SseTransport::connect(
                            client,
                            url.clone(),
                            headers,
                            self.connect_timeout,
                            self.request_timeout,
                            self.debug,
                        )
                        .await?
                    }
                    TransportKind::Http | TransportKind::StreamableHttp => {
                        let client = self.http_client(strategy.applies_request_timeout())?;
                        HttpTransport::new(
                            client,
                            url.clone(),
                            headers,
                            kind == TransportKind::StreamableHttp,
                            self.debug,
                        )
                    }
                    TransportKind::Stdio => {
                        return Err(Error::Internal("stdio descriptor with a URL".to_string()));
                    }
                }
            }
        };

        tracing::debug!(transport = %kind, target = %descriptor, "Transport created");
        Ok((transport, strategy))
    }
}

/// Decode an HTTP body or event payload: one message or a batch array
pub(crate) fn decode_payload(body: &[u8]) -> Result<Vec<JsonRpcMessage>> {
    let trimmed = body.trim_ascii();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.first() == Some(&b'[') {
        Ok(serde_json::from_slice(trimmed)?)
    } else {
        Ok(vec![serde_json::from_slice(trimmed)?])
    }
}

/// Why an inbox stopped accepting messages
#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    Exited { pid: u32, code: Option<i32> },
    Other(String),
}

/// Inbound queue shared by every transport: producers (reader tasks, POST
/// handlers) push, the single consumer drains through [`Transport::receive`].
pub(crate) struct Inbox {
    tx: mpsc::Sender<JsonRpcMessage>,
    rx: tokio::sync::Mutex<mpsc::Receiver<JsonRpcMessage>>,
    closed: CancellationToken,
    reason: Mutex<Option<CloseReason>>,
}

impl Inbox {
    const CAPACITY: usize = 256;

    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(Self::CAPACITY);
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            reason: Mutex::new(None),
        })
    }

    pub(crate) async fn push(&self, message: JsonRpcMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.tx.send(message).await.map_err(|_| self.closed_error())
    }

    /// First reason wins
    pub(crate) fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_error(&self) -> Error {
        match self.reason.lock().clone() {
            Some(CloseReason::Exited { pid, code }) => Error::ProcessExited { pid, code },
            Some(CloseReason::Other(reason)) => Error::TransportClosed(reason),
            None => Error::TransportClosed("transport closed".to_string()),
        }
    }

    pub(crate) async fn recv(&self, deadline: Option<Duration>) -> Result<JsonRpcMessage> {
        let mut rx = self.rx.lock().await;
        let next = async {
            tokio::select! {
                biased;
                message = rx.recv() => message,
                () = self.closed.cancelled() => rx.try_recv().ok(),
            }
        };
        let message = match deadline {
            Some(limit) => tokio::time::timeout(limit, next)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => next.await,
        };
        message.ok_or_else(|| self.closed_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcNotification;

    #[test]
    fn kind_parsing() {
        assert_eq!("stdio".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!(
            "Streamable-HTTP".parse::<TransportKind>().unwrap(),
            TransportKind::StreamableHttp
        );
        let err = "websocket".parse::<TransportKind>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported transport type 'websocket' (supported: stdio, http, sse, streamable-http)"
        );
    }

    #[test]
    fn descriptor_rejects_mismatched_targets() {
        assert!(ConnectionDescriptor::new("stdio", None, vec![], Some("http://x".into()), vec![]).is_err());
        assert!(ConnectionDescriptor::new("http", Some("node".into()), vec![], None, vec![]).is_err());
        assert!(
            ConnectionDescriptor::new("sse", Some("node".into()), vec![], Some("http://x".into()), vec![])
                .is_err()
        );
        assert!(matches!(
            ConnectionDescriptor::new("ftp", None, vec![], Some("ftp://x".into()), vec![]),
            Err(Error::UnsupportedTransport(_))
        ));
    }

    #[test]
    fn descriptor_validates_url_scheme() {
        let err = ConnectionDescriptor::network(TransportKind::Http, "ftp://host/mcp", vec![])
            .unwrap_err();
        assert!(err.to_string().contains("http or https"));
        assert!(ConnectionDescriptor::network(TransportKind::Http, "not a url", vec![]).is_err());

        let ok = ConnectionDescriptor::network(
            TransportKind::StreamableHttp,
            "https://example.com/mcp",
            vec![("Authorization".into(), "Bearer t".into())],
        )
        .unwrap();
        assert_eq!(ok.kind(), TransportKind::StreamableHttp);
        assert_eq!(ok.url().map(Url::as_str), Some("https://example.com/mcp"));
        assert!(ok.command().is_none());
        assert!(!ok.to_string().contains("Bearer"));
    }

    #[test]
    fn descriptor_rejects_bad_header() {
        let err = ConnectionDescriptor::network(
            TransportKind::Http,
            "http://localhost/mcp",
            vec![("bad header".into(), "v".into())],
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid header name"));
    }

    #[test]
    fn context_strategy_per_kind() {
        assert_eq!(
            ContextStrategy::for_kind(TransportKind::Stdio),
            ContextStrategy::TerminateProcess
        );
        assert_eq!(
            ContextStrategy::for_kind(TransportKind::StreamableHttp),
            ContextStrategy::AbortRequest
        );
        let sse = ContextStrategy::for_kind(TransportKind::Sse);
        assert_eq!(sse, ContextStrategy::CloseStream);
        assert!(!sse.applies_request_timeout());
        assert!(ContextStrategy::AbortRequest.applies_request_timeout());
    }

    #[tokio::test]
    async fn inbox_drains_queue_before_reporting_close() {
        let inbox = Inbox::new();
        inbox
            .push(JsonRpcNotification::new("a", None).into())
            .await
            .unwrap();
        inbox.close(CloseReason::Exited { pid: 7, code: Some(1) });
        inbox.close(CloseReason::Other("ignored".into()));

        let first = inbox.recv(None).await.unwrap();
        assert_eq!(first.method(), Some("a"));

        let err = inbox.recv(None).await.unwrap_err();
        assert!(matches!(err, Error::ProcessExited { pid: 7, code: Some(1) }));
        assert!(inbox.push(JsonRpcNotification::new("b", None).into()).await.is_err());
    }

    #[tokio::test]
    async fn inbox_recv_times_out() {
        let inbox = Inbox::new();
        let err = inbox.recv(Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
