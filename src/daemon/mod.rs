//! Local control daemon
//!
//! Keeps one MCP session open and serves the service facade as JSON-RPC 2.0
//! over a unix domain socket, one message per line. The CLI talks to it with
//! [`DaemonClient`] when `--socket` is given.

#[cfg(unix)]
mod client;
#[cfg(unix)]
mod server;

#[cfg(unix)]
pub use self::client::DaemonClient;
#[cfg(unix)]
pub use self::server::DaemonServer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::transport::ConnectionDescriptor;

/// Longest accepted request or response line
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Method names served by the daemon
pub mod methods {
    /// Open a session
    pub const CONNECT: &str = "connect";
    /// Close the session
    pub const DISCONNECT: &str = "disconnect";
    /// Session state
    pub const IS_CONNECTED: &str = "is_connected";
    /// List tools
    pub const LIST_TOOLS: &str = "list_tools";
    /// Call a tool
    pub const CALL_TOOL: &str = "call_tool";
    /// List resources
    pub const LIST_RESOURCES: &str = "list_resources";
    /// Read a resource
    pub const READ_RESOURCE: &str = "read_resource";
    /// List prompts
    pub const LIST_PROMPTS: &str = "list_prompts";
    /// Render a prompt
    pub const GET_PROMPT: &str = "get_prompt";
    /// Server details
    pub const SERVER_INFO: &str = "server_info";
    /// Round trip to the server
    pub const PING: &str = "ping";
    /// Health, errors and trace
    pub const DIAGNOSTICS: &str = "diagnostics";
    /// Stop the daemon
    pub const SHUTDOWN: &str = "shutdown";
}

/// Parameters of the `connect` method
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectParams {
    /// Transport kind
    pub transport: String,
    /// Command for stdio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// URL for network transports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra request headers
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl ConnectParams {
    /// Validated descriptor
    ///
    /// # Errors
    ///
    /// As [`ConnectionDescriptor::new`].
    pub fn to_descriptor(&self) -> Result<ConnectionDescriptor> {
        ConnectionDescriptor::new(
            &self.transport,
            self.command.clone(),
            self.args.clone(),
            self.url.clone(),
            self.headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl From<&ConnectionDescriptor> for ConnectParams {
    fn from(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            transport: descriptor.kind().to_string(),
            command: descriptor.command().map(ToString::to_string),
            args: descriptor.args().to_vec(),
            url: descriptor.url().map(ToString::to_string),
            headers: descriptor.headers().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    #[test]
    fn connect_params_round_trip_descriptor() {
        let descriptor = ConnectionDescriptor::network(
            TransportKind::StreamableHttp,
            "http://localhost:8080/mcp",
            vec![("Authorization".into(), "Bearer x".into())],
        )
        .unwrap();
        let params = ConnectParams::from(&descriptor);
        assert_eq!(params.transport, "streamable-http");
        assert_eq!(params.to_descriptor().unwrap(), descriptor);
    }

    #[test]
    fn unknown_transport_rejected() {
        let params = ConnectParams {
            transport: "websocket".into(),
            url: Some("http://localhost".into()),
            ..ConnectParams::default()
        };
        let err = params.to_descriptor().unwrap_err();
        assert!(err.to_string().contains("unsupported transport type 'websocket'"));
    }
}
