//! Error types for the MCP runtime
//!
//! [`Error`] is the raw failure produced by transports, the process manager
//! and the protocol client. It never leaves the public facade unclassified:
//! see [`crate::classify`] for the enriched form handed to callers.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the MCP runtime
pub type Result<T> = std::result::Result<T, Error>;

/// MCP runtime errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Command or argument rejected before spawning
    #[error("Unsafe command: {0}")]
    UnsafeCommand(String),

    /// Transport kind string not recognised
    #[error("unsupported transport type '{0}' (supported: stdio, http, sse, streamable-http)")]
    UnsupportedTransport(String),

    /// Child process could not be spawned
    #[error("Failed to start server process '{command}': {source}")]
    Spawn {
        /// Command that failed
        command: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Server process exited
    #[error("Server process {pid} exited{}", .code.map(|c| format!(" with status {c}")).unwrap_or_default())]
    ProcessExited {
        /// Process id
        pid: u32,
        /// Exit code when known
        code: Option<i32>,
    },

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Transport closed underneath a pending operation
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Deadline exceeded
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// No live session
    #[error("Not connected to a server; call connect first")]
    NotConnected,

    /// Connect while a session is live
    #[error("already connected")]
    AlreadyConnected,

    /// Connect while another transition is running
    #[error("connection attempt already in progress")]
    ConnectInProgress,

    /// Manager was shut down
    #[error("Runtime is closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::Config(_) | Self::UnsafeCommand(_) | Self::UnsupportedTransport(_) => {
                rpc_codes::INVALID_PARAMS
            }
            Self::NotConnected => rpc_codes::NOT_CONNECTED,
            Self::Timeout(_) => rpc_codes::TIMEOUT,
            Self::TransportClosed(_) | Self::ProcessExited { .. } => rpc_codes::CONNECTION_LOST,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Standard JSON-RPC error codes plus the runtime's custom server codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// No session is established
    pub const NOT_CONNECTED: i32 = -32001;
    /// The operation exceeded its deadline
    pub const TIMEOUT: i32 = -32002;
    /// The session's transport went away mid-operation
    pub const CONNECTION_LOST: i32 = -32003;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Server error range end
    pub const SERVER_ERROR_END: i32 = -32099;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_exit_message_includes_status() {
        let err = Error::ProcessExited { pid: 42, code: Some(3) };
        assert_eq!(err.to_string(), "Server process 42 exited with status 3");

        let err = Error::ProcessExited { pid: 42, code: None };
        assert_eq!(err.to_string(), "Server process 42 exited");
    }

    #[test]
    fn unsupported_transport_names_supported_set() {
        let msg = Error::UnsupportedTransport("ftp".to_string()).to_string();
        assert!(msg.contains("unsupported transport type"));
        assert!(msg.contains("stdio, http, sse, streamable-http"));
    }

    #[test]
    fn rpc_codes_for_runtime_conditions() {
        assert_eq!(Error::NotConnected.to_rpc_code(), rpc_codes::NOT_CONNECTED);
        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).to_rpc_code(),
            rpc_codes::TIMEOUT
        );
        assert_eq!(
            Error::TransportClosed("eof".into()).to_rpc_code(),
            rpc_codes::CONNECTION_LOST
        );
        assert_eq!(Error::json_rpc(-32601, "nope").to_rpc_code(), -32601);
    }
}
