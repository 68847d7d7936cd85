//! JSON-RPC client over any [`Transport`]
//!
//! A single dispatcher task drains the transport and routes each message:
//! responses complete the matching pending request, server `ping` requests
//! are answered, other server requests get "method not found", and
//! notifications fan out on a broadcast channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::rpc_codes;
use crate::protocol::{
    ClientCapabilities, Info, InitializeParams, InitializeResult, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId,
    SUPPORTED_PROTOCOL_VERSIONS, is_supported_version,
};
use crate::session::events::ProtocolTracer;
use crate::transport::{ContextStrategy, Transport, TransportKind};
use crate::{Error, Result};

type Pending = DashMap<RequestId, oneshot::Sender<JsonRpcResponse>>;

/// What ended the dispatcher
#[derive(Debug, Clone)]
enum Ended {
    Exited { pid: u32, code: Option<i32> },
    Other(String),
}

impl Ended {
    fn from_error(e: &Error) -> Self {
        match e {
            Error::ProcessExited { pid, code } => Self::Exited {
                pid: *pid,
                code: *code,
            },
            Error::TransportClosed(reason) => Self::Other(reason.clone()),
            other => Self::Other(other.to_string()),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            Self::Exited { pid, code } => Error::ProcessExited {
                pid: *pid,
                code: *code,
            },
            Self::Other(reason) => Error::TransportClosed(reason.clone()),
        }
    }
}

/// Removes a pending entry when the request future is dropped or finishes
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Protocol client owning one transport
pub struct ProtocolClient {
    transport: Arc<dyn Transport>,
    strategy: ContextStrategy,
    pending: Arc<Pending>,
    next_id: AtomicI64,
    notifications: broadcast::Sender<JsonRpcNotification>,
    tracer: Arc<ProtocolTracer>,
    request_timeout: Duration,
    ended: Arc<Mutex<Option<Ended>>>,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolClient {
    /// Wrap a transport and start the dispatcher task
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        strategy: ContextStrategy,
        tracer: Arc<ProtocolTracer>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let (notifications, _) = broadcast::channel(64);
        let ended = Arc::new(Mutex::new(None));

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&transport),
            Arc::clone(&pending),
            notifications.clone(),
            Arc::clone(&tracer),
            Arc::clone(&ended),
        ));

        Arc::new(Self {
            transport,
            strategy,
            pending,
            next_id: AtomicI64::new(1),
            notifications,
            tracer,
            request_timeout,
            ended,
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Transport kind underneath
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Cancellation strategy of the transport
    #[must_use]
    pub fn strategy(&self) -> ContextStrategy {
        self.strategy
    }

    /// Subscribe to server notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    /// Transport alive and dispatcher running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.ended.lock().is_none()
            && self.transport.is_connected()
    }

    fn closed_error(&self) -> Error {
        match self.ended.lock().as_ref() {
            Some(ended) => ended.to_error(),
            None if self.closed.load(Ordering::SeqCst) => {
                Error::TransportClosed("client closed".to_string())
            }
            None => Error::TransportClosed("response channel closed".to_string()),
        }
    }

    /// Send a request and wait for its result.
    ///
    /// `timeout` defaults to the configured request timeout and covers both
    /// the write and the wait. Dropping the returned future abandons the
    /// request cleanly.
    ///
    /// # Errors
    ///
    /// `Error::JsonRpc` for error responses, `Error::Timeout` at the deadline,
    /// or the transport's close reason.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) || self.ended.lock().is_some() {
            return Err(self.closed_error());
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };
        // The dispatcher may have drained `pending` since the check above
        if self.ended.lock().is_some() {
            return Err(self.closed_error());
        }

        self.tracer.request_sent(&id, method);
        trace!(id = %id, method, "Sending request");

        let deadline = timeout.unwrap_or(self.request_timeout);
        let exchange = async {
            self.transport
                .send(JsonRpcRequest::new(id.clone(), method, params).into())
                .await?;
            rx.await.map_err(|_| self.closed_error())
        };

        let response = match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.tracer.error(Some(method), Some(&id), &e.to_string());
                return Err(e);
            }
            Err(_) => {
                self.tracer
                    .error(Some(method), Some(&id), "request timed out");
                self.cancel_remote(&id, "request timed out");
                return Err(Error::Timeout(deadline));
            }
        };

        let error_message = response.error.as_ref().map(|e| e.message.as_str());
        self.tracer.response_received(&id, error_message);

        if let Some(error) = response.error {
            return Err(Error::JsonRpc {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Typed request: serialize params, deserialize the result
    ///
    /// # Errors
    ///
    /// As [`request`](Self::request), plus `Error::Json` when the result
    /// does not match `R`.
    pub async fn call<P, R>(&self, method: &str, params: Option<&P>) -> Result<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params = params.map(serde_json::to_value).transpose()?;
        let value = self.request(method, params, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Tell the server to stop working on an abandoned request. Best effort.
    fn cancel_remote(&self, id: &RequestId, reason: &str) {
        let transport = Arc::clone(&self.transport);
        let note = JsonRpcNotification::new(
            "notifications/cancelled",
            Some(json!({ "requestId": id, "reason": reason })),
        );
        tokio::spawn(async move {
            if let Err(e) = transport.send(note.into()).await {
                debug!(error = %e, "Failed to send cancellation");
            }
        });
    }

    /// Send a notification
    ///
    /// # Errors
    ///
    /// Transport write failures.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.tracer.notification(method, false);
        self.transport
            .send(JsonRpcNotification::new(method, params).into())
            .await
    }

    /// Run the `initialize` handshake and send `notifications/initialized`.
    ///
    /// # Errors
    ///
    /// `Error::Protocol` when the server picks a protocol version this client
    /// does not speak, plus anything [`request`](Self::request) returns.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Info::client(),
        };
        let value = self
            .request("initialize", Some(serde_json::to_value(params)?), Some(timeout))
            .await?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid initialize result: {e}")))?;

        if !is_supported_version(&result.protocol_version) {
            return Err(Error::Protocol(format!(
                "server protocol version '{}' is not supported (supported: {})",
                result.protocol_version,
                SUPPORTED_PROTOCOL_VERSIONS.join(", ")
            )));
        }

        self.notify("notifications/initialized", None).await?;
        debug!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "Handshake complete"
        );
        Ok(result)
    }

    /// Round-trip a `ping`
    ///
    /// # Errors
    ///
    /// As [`request`](Self::request).
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Duration> {
        let started = Instant::now();
        self.request("ping", None, timeout).await?;
        Ok(started.elapsed())
    }

    /// Close the transport and stop the dispatcher. Idempotent.
    ///
    /// # Errors
    ///
    /// Transport close failures.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.transport.close().await;
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            handle.abort();
        }
        // Wake every waiter; they report the close reason
        self.pending.clear();
        result
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

async fn dispatch(
    transport: Arc<dyn Transport>,
    pending: Arc<Pending>,
    notifications: broadcast::Sender<JsonRpcNotification>,
    tracer: Arc<ProtocolTracer>,
    ended: Arc<Mutex<Option<Ended>>>,
) {
    loop {
        let message = match transport.receive(None).await {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Dispatcher stopping");
                *ended.lock() = Some(Ended::from_error(&e));
                // Dropping the senders fails every waiter with the close reason
                pending.clear();
                return;
            }
        };

        match message {
            JsonRpcMessage::Response(response) => {
                let Some(id) = response.id.clone() else {
                    warn!(error = ?response.error, "Response without id");
                    continue;
                };
                match pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = %id, "Response for unknown or abandoned request"),
                }
            }
            JsonRpcMessage::Request(request) => {
                let reply = if request.method == "ping" {
                    JsonRpcResponse::success(request.id, json!({}))
                } else {
                    debug!(method = %request.method, "Rejecting server request");
                    JsonRpcResponse::error(
                        Some(request.id),
                        rpc_codes::METHOD_NOT_FOUND,
                        format!("Method not found: {}", request.method),
                    )
                };
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    if let Err(e) = transport.send(reply.into()).await {
                        debug!(error = %e, "Failed to answer server request");
                    }
                });
            }
            JsonRpcMessage::Notification(notification) => {
                tracer.notification(&notification.method, true);
                trace!(method = %notification.method, "Notification");
                let _ = notifications.send(notification);
            }
        }
    }
}
