//! Command-line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::daemon::ConnectParams;
use crate::{Error, Result};

/// MCP Runtime - connect to MCP servers over stdio, HTTP, SSE or streamable HTTP
#[derive(Parser, Debug)]
#[command(name = "mcp-runtime")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_RUNTIME_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MCP_RUNTIME_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, env = "MCP_RUNTIME_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Log HTTP traffic including bodies
    #[arg(long, global = true)]
    pub debug: bool,

    /// Request timeout (e.g. "500ms", "30s")
    #[arg(long, global = true, value_parser = parse_duration)]
    pub timeout: Option<std::time::Duration>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List tools
    Tools {
        /// Server to talk to
        #[command(flatten)]
        target: Target,
    },

    /// Call a tool
    Call {
        /// Tool name
        #[arg(long)]
        tool: String,

        /// JSON arguments
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Server to talk to
        #[command(flatten)]
        target: Target,
    },

    /// List resources
    Resources {
        /// Server to talk to
        #[command(flatten)]
        target: Target,
    },

    /// Read a resource
    Read {
        /// Resource URI
        #[arg(long)]
        uri: String,

        /// Server to talk to
        #[command(flatten)]
        target: Target,
    },

    /// List prompts
    Prompts {
        /// Server to talk to
        #[command(flatten)]
        target: Target,
    },

    /// Render a prompt
    Prompt {
        /// Prompt name
        #[arg(long)]
        name: String,

        /// Prompt argument as KEY=VALUE (repeatable)
        #[arg(long = "arg", value_parser = parse_key_value)]
        arguments: Vec<(String, String)>,

        /// Server to talk to
        #[command(flatten)]
        target: Target,
    },

    /// Show server details and diagnostics
    Info {
        /// Server to talk to
        #[command(flatten)]
        target: Target,
    },

    /// Keep a session open behind a unix socket (`--socket`, else
    /// `daemon.socket_path`)
    Daemon {
        /// Server to talk to
        #[command(flatten)]
        target: Target,
    },
}

/// Which server to talk to
#[derive(Args, Debug, Clone, Default)]
pub struct Target {
    /// Transport (stdio, http, sse, streamable-http)
    #[arg(short, long, default_value = "stdio")]
    pub transport: String,

    /// Server URL for network transports
    #[arg(short, long)]
    pub url: Option<String>,

    /// Extra request header as KEY=VALUE (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_key_value)]
    pub headers: Vec<(String, String)>,

    /// Daemon socket: route the command through it, or listen on it
    #[arg(long, env = "MCP_RUNTIME_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Server command and arguments for stdio
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Target {
    /// Whether a server was named on the command line
    #[must_use]
    pub fn is_specified(&self) -> bool {
        !self.command.is_empty() || self.url.is_some()
    }

    /// Connection parameters. A single command word containing spaces is
    /// split with shell quoting rules.
    ///
    /// # Errors
    ///
    /// `Error::Config` when the command line cannot be split.
    pub fn connect_params(&self) -> Result<ConnectParams> {
        let mut words = self.command.clone();
        if let [single] = words.as_slice() {
            if single.contains(char::is_whitespace) {
                words = shlex::split(single).ok_or_else(|| {
                    Error::Config(format!("cannot split command line '{single}'"))
                })?;
            }
        }
        let mut words = words.into_iter();

        Ok(ConnectParams {
            transport: self.transport.clone(),
            command: words.next(),
            args: words.collect(),
            url: self.url.clone(),
            headers: self.headers.iter().cloned().collect(),
        })
    }
}

/// Parse `KEY=VALUE`
///
/// # Errors
///
/// Returns a message when `=` is missing or the key is empty.
pub fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn parse_duration(s: &str) -> std::result::Result<std::time::Duration, String> {
    crate::config::humantime_serde::parse(s).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        let command = Cli::command();
        command.clone().debug_assert();
        // Every server-facing subcommand takes the same target flags
        for name in ["tools", "call", "resources", "read", "prompts", "prompt", "info", "daemon"] {
            let sub = command.find_subcommand(name).unwrap();
            assert!(sub.get_arguments().any(|a| a.get_id() == "transport"), "{name}");
        }
    }

    #[test]
    fn parses_stdio_trailing_command() {
        let cli = Cli::parse_from([
            "mcp-runtime",
            "tools",
            "--",
            "npx",
            "-y",
            "@modelcontextprotocol/server-everything",
        ]);
        let Command::Tools { target } = cli.command else {
            panic!("expected tools");
        };
        let params = target.connect_params().unwrap();
        assert_eq!(params.transport, "stdio");
        assert_eq!(params.command.as_deref(), Some("npx"));
        assert_eq!(params.args, vec!["-y", "@modelcontextprotocol/server-everything"]);
    }

    #[test]
    fn splits_single_quoted_command() {
        let target = Target {
            command: vec!["server --name 'my server'".into()],
            ..Target::default()
        };
        let params = target.connect_params().unwrap();
        assert_eq!(params.command.as_deref(), Some("server"));
        assert_eq!(params.args, vec!["--name", "my server"]);
    }

    #[test]
    fn parses_network_target_with_headers() {
        let cli = Cli::parse_from([
            "mcp-runtime",
            "--timeout",
            "500ms",
            "info",
            "--transport",
            "streamable-http",
            "--url",
            "http://127.0.0.1:8080/mcp",
            "-H",
            "Authorization=Bearer abc",
        ]);
        assert_eq!(cli.timeout, Some(std::time::Duration::from_millis(500)));
        let Command::Info { target } = cli.command else {
            panic!("expected info");
        };
        let params = target.connect_params().unwrap();
        assert_eq!(params.url.as_deref(), Some("http://127.0.0.1:8080/mcp"));
        assert_eq!(params.headers["Authorization"], "Bearer abc");
        assert!(params.to_descriptor().is_ok());
    }

    #[test]
    fn key_value_requires_equals() {
        assert!(parse_key_value("novalue").is_err());
        assert_eq!(
            parse_key_value("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
    }
}
