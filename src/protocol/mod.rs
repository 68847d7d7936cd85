//! MCP protocol types (client side)

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// Protocol version proposed in the `initialize` request
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions this client accepts from a server
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// JSON-RPC version tag
pub const JSONRPC_VERSION: &str = "2.0";

/// Check whether a server-announced protocol version is usable
#[must_use]
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}
