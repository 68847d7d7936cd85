//! Service facade
//!
//! Thin layer over the [`SessionManager`] used by the CLI and the daemon.
//! Every operation resolves the current session, issues one MCP request and
//! classifies failures. A recoverable failure that leaves the transport dead
//! schedules a background reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Error;
use crate::classify::{ClassifiedError, ClientResult, ErrorContext};
use crate::config::Config;
use crate::protocol::{
    Capabilities, Prompt, PromptsGetParams, PromptsGetResult, PromptsListResult, Resource,
    ResourceContents, ResourcesListResult, ResourcesReadParams, ResourcesReadResult, Tool,
    ToolsCallParams, ToolsCallResult, ToolsListResult, cursor_params,
};
use crate::session::{
    ConnectionHealth, ErrorStatistics, ProtocolEvent, Session, SessionManager, TracingStatistics,
};
use crate::transport::{ConnectionDescriptor, TransportKind};

/// Upper bound on pages fetched by one list call
const MAX_PAGES: usize = 100;

/// Events included in a diagnostics snapshot
const DIAGNOSTIC_EVENTS: usize = 50;

/// Server details captured at handshake
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    /// Session id
    pub session_id: Uuid,
    /// Server name
    pub name: String,
    /// Server version
    pub version: String,
    /// Negotiated protocol version
    pub protocol_version: String,
    /// Asserted capabilities
    pub capabilities: Capabilities,
    /// Usage instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Transport kind
    pub transport: TransportKind,
}

impl From<&Session> for ServerInfo {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            name: session.server_info().name.clone(),
            version: session.server_info().version.clone(),
            protocol_version: session.protocol_version().to_string(),
            capabilities: session.capabilities().clone(),
            instructions: session.instructions().map(ToString::to_string),
            transport: session.kind(),
        }
    }
}

/// Everything the diagnostic getters report, in one snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// Connection health
    pub health: ConnectionHealth,
    /// Error counters and history
    pub errors: ErrorStatistics,
    /// Protocol trace counters
    pub tracing: TracingStatistics,
    /// Latest protocol events
    pub recent_events: Vec<ProtocolEvent>,
}

/// MCP operations over the managed session
#[derive(Clone)]
pub struct McpService {
    sessions: Arc<SessionManager>,
}

impl McpService {
    /// Service with the built-in transports
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_manager(SessionManager::new(config))
    }

    /// Service over an existing session manager
    #[must_use]
    pub fn with_manager(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Underlying session manager
    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Connect and return the server details
    #[tracing::instrument(skip(self, descriptor), fields(transport = %descriptor.kind()))]
    pub async fn connect(&self, descriptor: ConnectionDescriptor) -> ClientResult<ServerInfo> {
        let session = self.sessions.connect(descriptor).await?;
        Ok(ServerInfo::from(session.as_ref()))
    }

    /// Disconnect. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.sessions.disconnect().await
    }

    /// Connected with a live transport
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.sessions.is_connected()
    }

    /// Server details of the current session
    pub fn server_info(&self) -> ClientResult<ServerInfo> {
        let session = self.sessions.require_session("server_info")?;
        Ok(ServerInfo::from(session.as_ref()))
    }

    /// Every tool, following pagination
    #[tracing::instrument(skip(self))]
    pub async fn list_tools(&self) -> ClientResult<Vec<Tool>> {
        self.paginate("list_tools", "tools/list", |page: ToolsListResult| {
            (page.tools, page.next_cursor)
        })
        .await
    }

    /// Call a tool
    #[tracing::instrument(skip(self, arguments))]
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ClientResult<ToolsCallResult> {
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };
        let params = ToolsCallParams {
            name: name.to_string(),
            arguments,
        };
        let result: ToolsCallResult = self.execute("call_tool", "tools/call", &params).await?;
        if result.is_error {
            debug!(tool = name, "Tool reported an error result");
        }
        Ok(result)
    }

    /// Every resource, following pagination
    #[tracing::instrument(skip(self))]
    pub async fn list_resources(&self) -> ClientResult<Vec<Resource>> {
        self.paginate("list_resources", "resources/list", |page: ResourcesListResult| {
            (page.resources, page.next_cursor)
        })
        .await
    }

    /// Read one resource
    #[tracing::instrument(skip(self))]
    pub async fn read_resource(&self, uri: &str) -> ClientResult<Vec<ResourceContents>> {
        let params = ResourcesReadParams {
            uri: uri.to_string(),
        };
        let result: ResourcesReadResult =
            self.execute("read_resource", "resources/read", &params).await?;
        Ok(result.contents)
    }

    /// Every prompt, following pagination
    #[tracing::instrument(skip(self))]
    pub async fn list_prompts(&self) -> ClientResult<Vec<Prompt>> {
        self.paginate("list_prompts", "prompts/list", |page: PromptsListResult| {
            (page.prompts, page.next_cursor)
        })
        .await
    }

    /// Render a prompt
    #[tracing::instrument(skip(self, arguments))]
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> ClientResult<PromptsGetResult> {
        let params = PromptsGetParams {
            name: name.to_string(),
            arguments: (!arguments.is_empty()).then_some(arguments),
        };
        self.execute("get_prompt", "prompts/get", &params).await
    }

    /// Round trip in milliseconds
    #[tracing::instrument(skip(self))]
    pub async fn ping(&self) -> ClientResult<u64> {
        let session = self.sessions.require_session("ping")?;
        match session.client().ping(None).await {
            Ok(elapsed) => Ok(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
            Err(e) => Err(self.failed("ping", &session, e)),
        }
    }

    /// Connection health
    #[must_use]
    pub fn connection_health(&self) -> ConnectionHealth {
        self.sessions.connection_health()
    }

    /// Error counters and history
    #[must_use]
    pub fn error_statistics(&self) -> ErrorStatistics {
        self.sessions.error_statistics()
    }

    /// Protocol trace counters
    #[must_use]
    pub fn tracing_statistics(&self) -> TracingStatistics {
        self.sessions.tracing_statistics()
    }

    /// Latest `n` protocol events
    #[must_use]
    pub fn recent_events(&self, n: usize) -> Vec<ProtocolEvent> {
        self.sessions.recent_events(n)
    }

    /// All diagnostics at once
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            health: self.connection_health(),
            errors: self.error_statistics(),
            tracing: self.tracing_statistics(),
            recent_events: self.recent_events(DIAGNOSTIC_EVENTS),
        }
    }

    /// Disconnect and release every resource
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    async fn execute<P, R>(&self, operation: &str, method: &str, params: &P) -> ClientResult<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let session = self.sessions.require_session(operation)?;
        session
            .client()
            .call(method, Some(params))
            .await
            .map_err(|e| self.failed(operation, &session, e))
    }

    async fn paginate<Page, Item>(
        &self,
        operation: &str,
        method: &str,
        split: impl Fn(Page) -> (Vec<Item>, Option<String>),
    ) -> ClientResult<Vec<Item>>
    where
        Page: DeserializeOwned,
    {
        let session = self.sessions.require_session(operation)?;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        for _ in 0..MAX_PAGES {
            let value = session
                .client()
                .request(method, cursor_params(cursor.as_deref()), None)
                .await
                .map_err(|e| self.failed(operation, &session, e))?;
            let page: Page = serde_json::from_value(value)
                .map_err(|e| self.failed(operation, &session, Error::Json(e)))?;
            let (mut batch, next) = split(page);
            items.append(&mut batch);

            match next {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.clone()) {
                        warn!(operation, cursor = %next, "Server repeated a pagination cursor");
                        break;
                    }
                    cursor = Some(next);
                }
                _ => return Ok(items),
            }
        }
        debug!(operation, count = items.len(), "Stopped paginating");
        Ok(items)
    }

    fn failed(&self, operation: &str, session: &Session, error: Error) -> ClassifiedError {
        let classified = self.sessions.fail(
            error,
            &ErrorContext::operation(operation).with_transport(Some(session.kind())),
        );
        if classified.is_recoverable() && !session.client().is_alive() {
            warn!(
                operation,
                category = %classified.category(),
                "Transport lost, reconnecting in the background"
            );
            self.sessions.spawn_reconnect();
        }
        classified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;

    #[tokio::test]
    async fn operations_require_a_session() {
        let service = McpService::new(&Config::default());
        assert!(!service.is_connected());

        let err = service.list_tools().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ClientUsage);
        assert!(err.message().contains("connect"));

        let err = service.server_info().unwrap_err();
        assert_eq!(err.operation(), Some("server_info"));

        assert_eq!(service.error_statistics().total, 2);
        service.disconnect().await.unwrap();
        service.shutdown().await;
    }
}
