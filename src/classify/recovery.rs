//! Human guidance per error category

use super::ErrorCategory;

/// Suggested next steps, most useful first
#[must_use]
pub fn recovery_actions(category: ErrorCategory) -> Vec<String> {
    let actions: &[&str] = match category {
        ErrorCategory::Connection => &[
            "Check that the server is running and reachable",
            "Verify the URL host and port",
            "Retry after a short delay",
        ],
        ErrorCategory::Transport => &[
            "Reconnect to the server",
            "Check server logs for crashes or dropped connections",
        ],
        ErrorCategory::Timeout => &[
            "Retry the operation",
            "Increase transport.request_timeout",
            "Check whether the server is overloaded",
        ],
        ErrorCategory::Authentication => &[
            "Check the credentials passed in request headers",
            "Confirm the token has not expired",
        ],
        ErrorCategory::Protocol => &[
            "Confirm the server speaks a supported MCP protocol version",
            "Check that the transport kind matches the server",
        ],
        ErrorCategory::Serialization => &[
            "Check that the server writes only JSON-RPC messages to its output",
            "Report the malformed message to the server author",
        ],
        ErrorCategory::Validation => &[
            "Check the tool arguments against its input schema",
            "Check prompt and resource names",
        ],
        ErrorCategory::ServerStartup => &[
            "Check that the server command is installed and on PATH",
            "Run the command by hand to see its startup output",
            "Check file permissions on the executable",
        ],
        ErrorCategory::ServerInternal => &[
            "Retry the operation",
            "Check server logs for the failure",
        ],
        ErrorCategory::ServerUnavailable => &[
            "Wait and retry; the server may be restarting or rate limiting",
            "Check server health",
        ],
        ErrorCategory::ServerCapability => &[
            "List the server capabilities to see what it supports",
            "Use a server that implements this feature",
        ],
        ErrorCategory::ClientConfig => &[
            "Fix the connection settings",
            "Pass the command and its arguments separately, without shell syntax",
        ],
        ErrorCategory::ClientUsage => &[
            "Connect before issuing operations",
            "Wait for the current connection attempt to finish",
        ],
        ErrorCategory::ClientResource => &[
            "Close unused connections or processes",
            "Raise the open file limit",
        ],
        ErrorCategory::Unknown => &["Retry the operation", "Enable debug logging for details"],
    };
    actions.iter().map(ToString::to_string).collect()
}

/// One-line explanation for end users
#[must_use]
pub fn user_message(category: ErrorCategory, operation: Option<&str>) -> String {
    let what = operation.unwrap_or("the operation");
    match category {
        ErrorCategory::Connection => format!("Could not connect to the MCP server during {what}."),
        ErrorCategory::Transport => format!("The connection to the MCP server broke during {what}."),
        ErrorCategory::Timeout => format!("The MCP server took too long to respond to {what}."),
        ErrorCategory::Authentication => "The MCP server rejected the credentials.".to_string(),
        ErrorCategory::Protocol => format!("The MCP server sent an unexpected reply to {what}."),
        ErrorCategory::Serialization => "A message from the MCP server could not be decoded.".to_string(),
        ErrorCategory::Validation => format!("The server rejected the request for {what} as invalid."),
        ErrorCategory::ServerStartup => "The MCP server process failed to start.".to_string(),
        ErrorCategory::ServerInternal => format!("The MCP server failed while handling {what}."),
        ErrorCategory::ServerUnavailable => "The MCP server is currently unavailable.".to_string(),
        ErrorCategory::ServerCapability => format!("The MCP server does not support {what}."),
        ErrorCategory::ClientConfig => "The connection settings are invalid.".to_string(),
        ErrorCategory::ClientUsage => format!("{what} cannot run in the current connection state."),
        ErrorCategory::ClientResource => "The client ran out of system resources.".to_string(),
        ErrorCategory::Unknown => format!("An unexpected error occurred during {what}."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_has_guidance() {
        for category in ErrorCategory::ALL {
            assert!(!recovery_actions(category).is_empty(), "{category}");
            assert!(!user_message(category, Some("list_tools")).is_empty());
        }
    }

    #[test]
    fn user_message_names_operation() {
        let msg = user_message(ErrorCategory::Timeout, Some("call_tool"));
        assert!(msg.contains("call_tool"));
    }
}
