//! MCP Runtime Library
//!
//! Client-side connection runtime for Model Context Protocol servers.
//!
//! # Features
//!
//! - **Transports**: stdio child processes, plain HTTP, SSE and streamable HTTP
//! - **Process management**: validated spawning, process groups, background reaping
//! - **Sessions**: handshake, reconnection with exponential backoff, health checks
//! - **Error classification**: categories with severity, retry hints and guidance
//! - **Daemon**: keep one session open behind a local unix socket
//!
//! # Protocol Version
//!
//! Proposes MCP 2025-06-18 and accepts 2025-03-26 and 2024-11-05 servers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod classify;
pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod process;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;

pub use classify::{ClassifiedError, ClientResult, ErrorCategory, Severity};
pub use error::{Error, Result};
pub use service::McpService;
pub use session::{ConnectionState, SessionManager};
pub use transport::{ConnectionDescriptor, TransportKind};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging. `RUST_LOG` overrides `level`. Logs go to stderr so
/// command output on stdout stays machine readable.
///
/// # Errors
///
/// `Error::Config` when a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}
