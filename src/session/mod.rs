//! Session lifecycle
//!
//! The [`SessionManager`] owns at most one live [`Session`]: it creates the
//! transport through a [`TransportFactory`], runs the MCP handshake, retries
//! recoverable failures with exponential backoff, and pings the server on a
//! fixed interval. Every public operation returns a [`ClassifiedError`].
//!
//! State changes happen under one mutex that is never held across an await.
//! Each transition bumps a generation counter; a connect attempt only
//! publishes its session if the generation it started with is still current.

pub mod events;
mod health;
mod policy;
mod stats;

pub use self::events::{EventKind, ProtocolEvent, ProtocolTracer, TracingStatistics};
pub use self::health::{HealthMetrics, HealthMonitor};
pub use self::policy::{BACKOFF_FACTOR, ReconnectionPolicy};
pub use self::stats::{ErrorLog, ErrorStatistics};

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Error;
use crate::classify::{ClassifiedError, ClientResult, ErrorContext, classify};
use crate::client::ProtocolClient;
use crate::config::{Config, SessionConfig};
use crate::process::{CommandPolicy, ProcessManager};
use crate::protocol::{Capabilities, Info, InitializeResult};
use crate::transport::{
    ConnectionDescriptor, ContextStrategy, DefaultTransportFactory, Transport, TransportFactory,
    TransportKind,
};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// First connect attempt in flight
    Connecting,
    /// Session published
    Connected,
    /// Retry scheduled or running
    Reconnecting,
    /// Manager shut down; terminal
    Closed,
}

impl ConnectionState {
    fn in_transition(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        })
    }
}

/// An initialized MCP session
pub struct Session {
    id: Uuid,
    client: Arc<ProtocolClient>,
    server_info: Info,
    protocol_version: String,
    capabilities: Capabilities,
    instructions: Option<String>,
    connected_at: DateTime<Utc>,
    kind: TransportKind,
}

impl Session {
    fn new(client: Arc<ProtocolClient>, init: InitializeResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: client.kind(),
            client,
            server_info: init.server_info,
            protocol_version: init.protocol_version,
            capabilities: init.capabilities,
            instructions: init.instructions,
            connected_at: Utc::now(),
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Protocol client bound to this session
    #[must_use]
    pub fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    /// Server name and version
    #[must_use]
    pub fn server_info(&self) -> &Info {
        &self.server_info
    }

    /// Negotiated protocol version
    #[must_use]
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Capabilities the server asserted
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Server usage instructions
    #[must_use]
    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// When the handshake completed
    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Transport kind
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Time since the handshake completed
    #[must_use]
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.connected_at).to_std().unwrap_or_default()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("server", &self.server_info.name)
            .field("protocol_version", &self.protocol_version)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Connection health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    /// Lifecycle state
    pub state: ConnectionState,
    /// Session present and transport alive
    pub connected: bool,
    /// Session id
    pub session_id: Option<Uuid>,
    /// Transport kind
    pub transport: Option<TransportKind>,
    /// Server name and version
    pub server: Option<Info>,
    /// Negotiated protocol version
    pub protocol_version: Option<String>,
    /// When the session was established
    pub connected_at: Option<DateTime<Utc>>,
    /// Session age in milliseconds
    pub uptime_ms: Option<u64>,
    /// Health check counters
    pub checks: HealthMetrics,
    /// Reconnect attempts since creation
    pub reconnect_attempts: u32,
    /// Most recent classified error
    pub last_error: Option<ClassifiedError>,
}

struct Inner {
    state: ConnectionState,
    session: Option<Arc<Session>>,
    generation: u64,
    connect_token: Option<CancellationToken>,
    health_token: Option<CancellationToken>,
    descriptor: Option<ConnectionDescriptor>,
}

/// How a connect run obtains its transport
enum Source {
    Descriptor(ConnectionDescriptor),
    Supplied(Arc<dyn Transport>, ContextStrategy),
}

/// Owns the current session and its lifecycle
pub struct SessionManager {
    config: SessionConfig,
    request_timeout: Duration,
    policy: ReconnectionPolicy,
    factory: Arc<dyn TransportFactory>,
    process_manager: Option<Arc<ProcessManager>>,
    tracer: Arc<ProtocolTracer>,
    health: HealthMonitor,
    errors: ErrorLog,
    reconnect_attempts: AtomicU32,
    inner: Mutex<Inner>,
}

impl SessionManager {
    /// Manager with the built-in transports and its own process manager
    #[must_use]
    pub fn new(config: &Config) -> Arc<Self> {
        let process_manager = ProcessManager::new(
            config.process.clone(),
            CommandPolicy {
                allow_absolute_paths: config.transport.allow_absolute_commands,
            },
        );
        let factory = Arc::new(DefaultTransportFactory::new(
            Arc::clone(&process_manager),
            &config.transport,
        ));
        Self::with_factory(
            config.session.clone(),
            config.transport.request_timeout,
            factory,
            Some(process_manager),
        )
    }

    /// Manager with a custom transport factory.
    ///
    /// `process_manager`, when given, is closed by [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn with_factory(
        config: SessionConfig,
        request_timeout: Duration,
        factory: Arc<dyn TransportFactory>,
        process_manager: Option<Arc<ProcessManager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            policy: ReconnectionPolicy::new(&config.reconnect),
            tracer: Arc::new(ProtocolTracer::new(config.event_buffer_size)),
            errors: ErrorLog::new(config.error_history_size),
            health: HealthMonitor::new(),
            reconnect_attempts: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                session: None,
                generation: 0,
                connect_token: None,
                health_token: None,
                descriptor: None,
            }),
            config,
            request_timeout,
            factory,
            process_manager,
        })
    }

    /// Reconnection policy in effect
    #[must_use]
    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.policy
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Connected with a live transport
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == ConnectionState::Connected
            && inner
                .session
                .as_ref()
                .is_some_and(|s| s.client().is_alive())
    }

    /// Current session, if connected
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        let inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connected => inner.session.clone(),
            _ => None,
        }
    }

    /// Current session or a classified "not connected" error for `operation`
    pub fn require_session(&self, operation: &str) -> ClientResult<Arc<Session>> {
        self.session()
            .ok_or_else(|| self.fail(Error::NotConnected, &ErrorContext::operation(operation)))
    }

    /// Classify and record an error
    pub fn fail(&self, error: Error, context: &ErrorContext) -> ClassifiedError {
        let classified = classify(error, context);
        self.errors.record(&classified);
        classified
    }

    /// Connect using `descriptor`, retrying recoverable failures per policy
    ///
    /// # Errors
    ///
    /// `client-usage` when already connected, a connect is in flight or the
    /// manager is closed; otherwise the last attempt's classified error.
    pub async fn connect(
        self: &Arc<Self>,
        descriptor: ConnectionDescriptor,
    ) -> ClientResult<Arc<Session>> {
        let ctx = ErrorContext::connecting(descriptor.kind());
        let (token, generation) = self.begin(ConnectionState::Connecting, &ctx, |inner| {
            inner.descriptor = Some(descriptor.clone());
        })?;
        info!(descriptor = %descriptor, transport = %descriptor.kind(), "Connecting");
        self.run(Source::Descriptor(descriptor), token, generation, &ctx)
            .await
    }

    /// Single handshake attempt on a transport the caller built
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect), without retries.
    pub async fn connect_with(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        strategy: ContextStrategy,
    ) -> ClientResult<Arc<Session>> {
        let ctx = ErrorContext::connecting(transport.kind());
        let (token, generation) = self.begin(ConnectionState::Connecting, &ctx, |inner| {
            inner.descriptor = None;
        })?;
        self.run(Source::Supplied(transport, strategy), token, generation, &ctx)
            .await
    }

    /// Replace the current session with a fresh one from the stored descriptor
    ///
    /// # Errors
    ///
    /// `client-usage` without a stored descriptor or while another
    /// transition runs; otherwise as [`connect`](Self::connect).
    pub async fn reconnect(self: &Arc<Self>) -> ClientResult<Arc<Session>> {
        let ctx = ErrorContext::operation("reconnect");
        let descriptor = self.inner.lock().descriptor.clone();
        let Some(descriptor) = descriptor else {
            return Err(self.fail(Error::NotConnected, &ctx));
        };
        let ctx = ErrorContext::connecting(descriptor.kind());

        let mut stale = None;
        let (token, generation) = self.begin(ConnectionState::Reconnecting, &ctx, |inner| {
            stale = inner.session.take();
            if let Some(health) = inner.health_token.take() {
                health.cancel();
            }
        })?;
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);

        if let Some(session) = stale {
            info!(session_id = %session.id(), "Replacing stale session");
            if let Err(e) = session.client().close().await {
                debug!(error = %e, "Error closing stale session");
            }
        }
        self.run(Source::Descriptor(descriptor), token, generation, &ctx)
            .await
    }

    /// Tear down the session and cancel any connect in flight. Idempotent.
    ///
    /// # Errors
    ///
    /// The classified transport close failure; the state is `Disconnected`
    /// regardless.
    pub async fn disconnect(&self) -> ClientResult<()> {
        let (session, connect, health) = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return Ok(());
            }
            inner.generation += 1;
            inner.state = ConnectionState::Disconnected;
            (
                inner.session.take(),
                inner.connect_token.take(),
                inner.health_token.take(),
            )
        };

        if let Some(token) = connect {
            debug!("Cancelling connect in flight");
            token.cancel();
        }
        if let Some(token) = health {
            token.cancel();
        }
        let Some(session) = session else {
            return Ok(());
        };

        info!(session_id = %session.id(), server = %session.server_info().name, "Disconnecting");
        session.client().close().await.map_err(|e| {
            self.fail(
                e,
                &ErrorContext::operation("disconnect").with_transport(Some(session.kind())),
            )
        })
    }

    /// Disconnect, stop the process manager and refuse further use
    pub async fn shutdown(&self) {
        if let Err(e) = self.disconnect().await {
            warn!(error = %e, "Error during disconnect on shutdown");
        }
        self.inner.lock().state = ConnectionState::Closed;
        if let Some(pm) = &self.process_manager {
            pm.close().await;
        }
        info!("Session manager shut down");
    }

    /// Health snapshot
    #[must_use]
    pub fn connection_health(&self) -> ConnectionHealth {
        let (state, session) = {
            let inner = self.inner.lock();
            (inner.state, inner.session.clone())
        };
        let connected = state == ConnectionState::Connected
            && session.as_ref().is_some_and(|s| s.client().is_alive());

        ConnectionHealth {
            state,
            connected,
            session_id: session.as_ref().map(|s| s.id()),
            transport: session.as_ref().map(|s| s.kind()),
            server: session.as_ref().map(|s| s.server_info().clone()),
            protocol_version: session.as_ref().map(|s| s.protocol_version().to_string()),
            connected_at: session.as_ref().map(|s| s.connected_at()),
            uptime_ms: session
                .as_ref()
                .map(|s| u64::try_from(s.uptime().as_millis()).unwrap_or(u64::MAX)),
            checks: self.health.metrics(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_error: self.errors.last(),
        }
    }

    /// Error counters and history
    #[must_use]
    pub fn error_statistics(&self) -> ErrorStatistics {
        self.errors.statistics()
    }

    /// Protocol trace counters
    #[must_use]
    pub fn tracing_statistics(&self) -> TracingStatistics {
        self.tracer.statistics()
    }

    /// Latest `n` protocol events, oldest first
    #[must_use]
    pub fn recent_events(&self, n: usize) -> Vec<ProtocolEvent> {
        self.tracer.recent(n)
    }

    /// Enter a transition state, or reject without touching anything
    fn begin(
        &self,
        next: ConnectionState,
        ctx: &ErrorContext,
        prepare: impl FnOnce(&mut Inner),
    ) -> ClientResult<(CancellationToken, u64)> {
        let mut inner = self.inner.lock();
        let rejection = match inner.state {
            ConnectionState::Closed => Some(Error::Closed),
            state if state.in_transition() => Some(Error::ConnectInProgress),
            ConnectionState::Connected if next == ConnectionState::Connecting => {
                Some(Error::AlreadyConnected)
            }
            _ => None,
        };
        if let Some(e) = rejection {
            drop(inner);
            return Err(self.fail(e, ctx));
        }

        prepare(&mut inner);
        let token = CancellationToken::new();
        inner.state = next;
        inner.generation += 1;
        inner.connect_token = Some(token.clone());
        Ok((token, inner.generation))
    }

    /// Set `state` if `generation` is still current
    fn settle(&self, generation: u64, state: ConnectionState) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.state = state;
        if state != ConnectionState::Reconnecting {
            inner.connect_token = None;
        }
        true
    }

    async fn run(
        self: &Arc<Self>,
        source: Source,
        token: CancellationToken,
        generation: u64,
        ctx: &ErrorContext,
    ) -> ClientResult<Arc<Session>> {
        let pending = PendingConnect::new(self, generation, token.clone());
        let mut attempt = 0u32;
        loop {
            let outcome = match &source {
                Source::Descriptor(descriptor) => {
                    self.establish(descriptor, &token, &pending).await
                }
                Source::Supplied(transport, strategy) => {
                    self.handshake(Arc::clone(transport), *strategy, &token, &pending)
                        .await
                }
            };

            let error = match outcome {
                Ok(session) => {
                    let published = self.publish(session, generation, ctx).await;
                    pending.release();
                    return published;
                }
                Err(e) => e,
            };

            let cancelled = matches!(error, Error::Cancelled) || token.is_cancelled();
            let classified = self.fail(error, ctx);
            if cancelled {
                self.settle(generation, ConnectionState::Disconnected);
                info!("Connect cancelled");
                return Err(classified);
            }

            // A caller-supplied transport cannot be rebuilt
            let retry = matches!(source, Source::Descriptor(_))
                && self.policy.should_retry(attempt, &classified);
            if !retry {
                self.settle(generation, ConnectionState::Disconnected);
                error!(
                    attempts = attempt + 1,
                    category = %classified.category(),
                    error = %classified.message(),
                    "Connect failed"
                );
                return Err(classified);
            }

            if !self.settle(generation, ConnectionState::Reconnecting) {
                return Err(self.fail(Error::Cancelled, ctx));
            }
            let delay = self.policy.delay_for(&classified, attempt);
            self.errors.record_retry();
            warn!(
                attempt = attempt + 1,
                max_attempts = self.policy.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                category = %classified.category(),
                error = %classified.message(),
                "Connect attempt failed, retrying"
            );

            tokio::select! {
                () = token.cancelled() => {
                    self.settle(generation, ConnectionState::Disconnected);
                    return Err(self.fail(Error::Cancelled, ctx));
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn establish(
        &self,
        descriptor: &ConnectionDescriptor,
        token: &CancellationToken,
        pending: &PendingConnect<'_>,
    ) -> crate::Result<Session> {
        let (transport, strategy) = tokio::select! {
            () = token.cancelled() => return Err(Error::Cancelled),
            created = self.factory.create(descriptor) => created?,
        };
        self.handshake(transport, strategy, token, pending).await
    }

    async fn handshake(
        &self,
        transport: Arc<dyn Transport>,
        strategy: ContextStrategy,
        token: &CancellationToken,
        pending: &PendingConnect<'_>,
    ) -> crate::Result<Session> {
        let client = ProtocolClient::new(
            transport,
            strategy,
            Arc::clone(&self.tracer),
            self.request_timeout,
        );
        pending.track(&client);
        let result = tokio::select! {
            () = token.cancelled() => Err(Error::Cancelled),
            init = client.initialize(self.config.handshake_timeout) => init,
        };
        match result {
            Ok(init) => Ok(Session::new(client, init)),
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    debug!(error = %close_err, "Error closing half-built transport");
                }
                pending.untrack();
                Err(e)
            }
        }
    }

    async fn publish(
        self: &Arc<Self>,
        session: Session,
        generation: u64,
        ctx: &ErrorContext,
    ) -> ClientResult<Arc<Session>> {
        let session = Arc::new(session);
        let health_token = CancellationToken::new();
        let published = {
            let mut inner = self.inner.lock();
            if inner.generation == generation && inner.state != ConnectionState::Closed {
                inner.state = ConnectionState::Connected;
                inner.session = Some(Arc::clone(&session));
                inner.connect_token = None;
                if let Some(old) = inner.health_token.replace(health_token.clone()) {
                    old.cancel();
                }
                true
            } else {
                false
            }
        };

        if !published {
            debug!(session_id = %session.id(), "Discarding session from a superseded connect");
            if let Err(e) = session.client().close().await {
                debug!(error = %e, "Error closing superseded session");
            }
            return Err(self.fail(Error::Cancelled, ctx));
        }

        self.health.reset();
        info!(
            session_id = %session.id(),
            server = %session.server_info().name,
            version = %session.server_info().version,
            protocol = %session.protocol_version(),
            transport = %session.kind(),
            "Connected"
        );
        if self.config.health_check.enabled {
            tokio::spawn(health_loop(
                Arc::downgrade(self),
                session.id(),
                self.config.health_check.interval,
                self.config.health_check.timeout,
                health_token,
            ));
        }
        Ok(session)
    }

    /// One health check; `true` when a reconnect should follow
    async fn check_health(&self, session: &Session, timeout: Duration) -> bool {
        match session.client().ping(Some(timeout)).await {
            Ok(latency) => {
                self.health.record_success(latency);
                debug!(session_id = %session.id(), latency_ms = latency.as_millis(), "Health check ok");
                false
            }
            Err(e) => {
                self.health.record_failure();
                let classified = self.fail(
                    e,
                    &ErrorContext::operation("health_check").with_transport(Some(session.kind())),
                );
                warn!(
                    session_id = %session.id(),
                    category = %classified.category(),
                    error = %classified.message(),
                    "Health check failed"
                );
                classified.is_recoverable() && self.policy.enabled
            }
        }
    }

    /// Kick off a reconnect in the background after a failed operation
    pub fn spawn_reconnect(self: &Arc<Self>) {
        if !self.policy.enabled || self.descriptor_missing() {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match manager.reconnect().await {
                Ok(session) => info!(session_id = %session.id(), "Reconnected"),
                Err(e) => warn!(category = %e.category(), error = %e.message(), "Reconnect failed"),
            }
        });
    }

    fn descriptor_missing(&self) -> bool {
        self.inner.lock().descriptor.is_none()
    }
}

/// Rolls back a connect run whose future is dropped before it settles.
///
/// Cancels the run's token, returns a still-current transitional state to
/// `Disconnected` and closes any client the run was building.
struct PendingConnect<'a> {
    manager: &'a SessionManager,
    generation: u64,
    token: CancellationToken,
    client: Mutex<Option<Arc<ProtocolClient>>>,
    armed: bool,
}

impl<'a> PendingConnect<'a> {
    fn new(manager: &'a SessionManager, generation: u64, token: CancellationToken) -> Self {
        Self {
            manager,
            generation,
            token,
            client: Mutex::new(None),
            armed: true,
        }
    }

    fn track(&self, client: &Arc<ProtocolClient>) {
        *self.client.lock() = Some(Arc::clone(client));
    }

    fn untrack(&self) {
        self.client.lock().take();
    }

    /// The run reached a terminal state on its own
    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.token.cancel();
        {
            let mut inner = self.manager.inner.lock();
            if inner.generation == self.generation && inner.state.in_transition() {
                inner.state = ConnectionState::Disconnected;
                inner.connect_token = None;
            }
        }
        let Some(client) = self.client.lock().take() else {
            return;
        };
        debug!(generation = self.generation, "Connect abandoned, closing its transport");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.close().await {
                        debug!(error = %e, "Error closing abandoned transport");
                    }
                });
            }
            Err(_) => warn!("No runtime to close an abandoned transport"),
        }
    }
}

async fn health_loop(
    manager: Weak<SessionManager>,
    session_id: Uuid,
    interval: Duration,
    timeout: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let Some(session) = manager.session().filter(|s| s.id() == session_id) else {
            break;
        };
        if manager.check_health(&session, timeout).await && !token.is_cancelled() {
            manager.spawn_reconnect();
            break;
        }
    }
    debug!(session_id = %session_id, "Health task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;
    use crate::config::ReconnectConfig;
    use crate::protocol::{JsonRpcMessage, JsonRpcResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Transport answering `initialize` and `ping` in-process
    struct FakeServer {
        tx: mpsc::Sender<JsonRpcMessage>,
        rx: tokio::sync::Mutex<mpsc::Receiver<JsonRpcMessage>>,
        closed: CancellationToken,
    }

    impl FakeServer {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::channel(16);
            Arc::new(Self {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                closed: CancellationToken::new(),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeServer {
        async fn send(&self, message: JsonRpcMessage) -> crate::Result<()> {
            if let JsonRpcMessage::Request(req) = message {
                let result = match req.method.as_str() {
                    "initialize" => json!({
                        "protocolVersion": crate::protocol::PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "fake", "version": "1.0"}
                    }),
                    _ => json!({}),
                };
                let _ = self
                    .tx
                    .send(JsonRpcResponse::success(req.id, result).into())
                    .await;
            }
            Ok(())
        }

        async fn receive(&self, _deadline: Option<Duration>) -> crate::Result<JsonRpcMessage> {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                () = self.closed.cancelled() => Err(Error::TransportClosed("fake closed".into())),
                message = rx.recv() => {
                    message.ok_or_else(|| Error::TransportClosed("fake closed".into()))
                }
            }
        }

        async fn close(&self) -> crate::Result<()> {
            self.closed.cancel();
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.closed.is_cancelled()
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Stdio
        }
    }

    struct FakeFactory {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn create(
            &self,
            _descriptor: &ConnectionDescriptor,
        ) -> crate::Result<(Arc<dyn Transport>, ContextStrategy)> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(Error::TransportClosed("connection reset".into()));
            }
            Ok((FakeServer::new(), ContextStrategy::TerminateProcess))
        }
    }

    fn manager(fail_first: usize, max_attempts: u32) -> (Arc<SessionManager>, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory {
            calls: AtomicUsize::new(0),
            fail_first,
        });
        let config = SessionConfig {
            reconnect: ReconnectConfig {
                enabled: true,
                max_attempts,
                base_delay: Some(Duration::from_millis(5)),
                max_delay: Duration::from_millis(20),
            },
            ..SessionConfig::default()
        };
        let manager = SessionManager::with_factory(
            config,
            Duration::from_secs(5),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            None,
        );
        (manager, factory)
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::stdio("fake-server", vec![]).unwrap()
    }

    #[tokio::test]
    async fn connect_publishes_session() {
        let (manager, _) = manager(0, 3);
        let session = manager.connect(descriptor()).await.unwrap();
        assert_eq!(session.server_info().name, "fake");
        assert!(session.capabilities().asserts("tools"));
        assert!(manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Connected);

        let err = manager.connect(descriptor()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ClientUsage);
        assert!(err.message().contains("already connected"));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn retries_recoverable_failures() {
        let (manager, factory) = manager(2, 3);
        manager.connect(descriptor()).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
        let stats = manager.error_statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (manager, factory) = manager(usize::MAX, 4);
        let err = manager.connect(descriptor()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 4);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (manager, _) = manager(0, 1);
        manager.connect(descriptor()).await.unwrap();
        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();
        assert!(!manager.is_connected());
        assert!(manager.session().is_none());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_replaces_session() {
        let (manager, _) = manager(0, 1);
        let first = manager.connect(descriptor()).await.unwrap();
        let second = manager.reconnect().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(!first.client().is_alive());
        assert_eq!(manager.connection_health().reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let (manager, _) = manager(0, 1);
        manager.connect(descriptor()).await.unwrap();
        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        let err = manager.connect(descriptor()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ClientUsage);
    }

    #[tokio::test]
    async fn not_connected_is_classified() {
        let (manager, _) = manager(0, 1);
        let err = manager.require_session("list_tools").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ClientUsage);
        assert_eq!(err.operation(), Some("list_tools"));
    }
}
