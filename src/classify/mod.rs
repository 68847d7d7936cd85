//! Error classification
//!
//! Turns a raw [`Error`] into a [`ClassifiedError`]: a category with fixed
//! severity, recoverability and default retry delay, plus guidance for the
//! user. The session manager's retry decisions are driven entirely by the
//! category.

mod recovery;

pub use recovery::{recovery_actions, user_message};

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::Error;
use crate::error::rpc_codes;
use crate::transport::TransportKind;

/// Result type of the public facade
pub type ClientResult<T> = std::result::Result<T, ClassifiedError>;

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Could not reach the server
    Connection,
    /// Established channel broke
    Transport,
    /// Deadline exceeded
    Timeout,
    /// Credentials rejected
    Authentication,
    /// Unexpected message shape or version
    Protocol,
    /// Undecodable payload
    Serialization,
    /// Server rejected arguments
    Validation,
    /// Server process failed to start
    ServerStartup,
    /// Server failed handling a request
    ServerInternal,
    /// Server temporarily unavailable
    ServerUnavailable,
    /// Server lacks the feature
    ServerCapability,
    /// Invalid connection settings
    ClientConfig,
    /// Operation not valid in the current state
    ClientUsage,
    /// Client out of OS resources
    ClientResource,
    /// Anything else
    Unknown,
}

impl ErrorCategory {
    /// Every category
    pub const ALL: [Self; 15] = [
        Self::Connection,
        Self::Transport,
        Self::Timeout,
        Self::Authentication,
        Self::Protocol,
        Self::Serialization,
        Self::Validation,
        Self::ServerStartup,
        Self::ServerInternal,
        Self::ServerUnavailable,
        Self::ServerCapability,
        Self::ClientConfig,
        Self::ClientUsage,
        Self::ClientResource,
        Self::Unknown,
    ];

    /// Kebab-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::Protocol => "protocol",
            Self::Serialization => "serialization",
            Self::Validation => "validation",
            Self::ServerStartup => "server-startup",
            Self::ServerInternal => "server-internal",
            Self::ServerUnavailable => "server-unavailable",
            Self::ServerCapability => "server-capability",
            Self::ClientConfig => "client-config",
            Self::ClientUsage => "client-usage",
            Self::ClientResource => "client-resource",
            Self::Unknown => "unknown",
        }
    }

    /// Fixed severity
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::Timeout | Self::Validation | Self::ServerCapability | Self::ClientUsage => {
                Severity::Warning
            }
            Self::ServerStartup | Self::ClientResource => Severity::Critical,
            _ => Severity::Error,
        }
    }

    /// Whether retrying can help
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        self.default_retry_delay().is_some()
    }

    /// Default delay before the first retry; `None` for unrecoverable categories
    #[must_use]
    pub fn default_retry_delay(self) -> Option<Duration> {
        match self {
            Self::Connection => Some(Duration::from_secs(2)),
            Self::Transport => Some(Duration::from_millis(500)),
            Self::Timeout => Some(Duration::from_secs(1)),
            Self::ServerUnavailable => Some(Duration::from_secs(5)),
            Self::ServerInternal => Some(Duration::from_secs(3)),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Self::ALL.into_iter().find(|c| c.as_str() == s).ok_or(())
    }
}

/// Error severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Degraded but usable
    Warning,
    /// Operation failed
    Error,
    /// Needs intervention
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        })
    }
}

/// Where an error happened
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Facade operation name
    pub operation: Option<String>,
    /// Transport in use
    pub transport: Option<TransportKind>,
    /// Raised while establishing a session
    pub during_connect: bool,
}

impl ErrorContext {
    /// Context for a named operation
    #[must_use]
    pub fn operation(name: impl Into<String>) -> Self {
        Self {
            operation: Some(name.into()),
            ..Self::default()
        }
    }

    /// Context for a connect attempt
    #[must_use]
    pub fn connecting(transport: TransportKind) -> Self {
        Self {
            operation: Some("connect".to_string()),
            transport: Some(transport),
            during_connect: true,
        }
    }

    /// Attach the transport kind
    #[must_use]
    pub fn with_transport(mut self, transport: Option<TransportKind>) -> Self {
        self.transport = transport;
        self
    }
}

/// A categorized failure. Immutable once built.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{category}: {message}")]
pub struct ClassifiedError {
    category: ErrorCategory,
    severity: Severity,
    recoverable: bool,
    #[serde(rename = "retry_after_ms", serialize_with = "serialize_ms")]
    retry_after: Option<Duration>,
    message: String,
    user_message: String,
    recovery_actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transport: Option<TransportKind>,
    timestamp: DateTime<Utc>,
    #[serde(skip)]
    #[source]
    cause: Option<Arc<Error>>,
}

#[allow(clippy::ref_option)]
fn serialize_ms<S: serde::Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        None => s.serialize_none(),
    }
}

impl ClassifiedError {
    /// Build directly from a category (no underlying cause)
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>, context: &ErrorContext) -> Self {
        Self {
            category,
            severity: category.severity(),
            recoverable: category.is_recoverable(),
            retry_after: category.default_retry_delay(),
            message: message.into(),
            user_message: user_message(category, context.operation.as_deref()),
            recovery_actions: recovery_actions(category),
            operation: context.operation.clone(),
            transport: context.transport,
            timestamp: Utc::now(),
            cause: None,
        }
    }

    /// Category
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Severity
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Whether retrying can help
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Suggested delay before retrying
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Technical message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Message for end users
    #[must_use]
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Recovery suggestions
    #[must_use]
    pub fn recovery_actions(&self) -> &[String] {
        &self.recovery_actions
    }

    /// Operation that failed
    #[must_use]
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// Transport in use when it failed
    #[must_use]
    pub fn transport(&self) -> Option<TransportKind> {
        self.transport
    }

    /// When it was classified
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Underlying raw error
    #[must_use]
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }

    /// Structured `data` member for JSON-RPC error replies
    #[must_use]
    pub fn to_data(&self) -> Value {
        json!({
            "category": self.category,
            "severity": self.severity,
            "recoverable": self.recoverable,
            "userMessage": self.user_message,
            "recoveryActions": self.recovery_actions,
        })
    }

    /// JSON-RPC code used when relaying this error
    #[must_use]
    pub fn rpc_code(&self) -> i32 {
        match (self.cause.as_deref(), self.category) {
            (Some(Error::NotConnected), _) => rpc_codes::NOT_CONNECTED,
            (Some(Error::JsonRpc { code, .. }), _) => *code,
            (_, ErrorCategory::Timeout) => rpc_codes::TIMEOUT,
            (_, ErrorCategory::Transport) => rpc_codes::CONNECTION_LOST,
            (_, ErrorCategory::ClientConfig | ErrorCategory::Validation) => {
                rpc_codes::INVALID_PARAMS
            }
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Classify a raw error
#[must_use]
pub fn classify(error: Error, context: &ErrorContext) -> ClassifiedError {
    let category = categorize(&error, context);
    let mut classified = ClassifiedError::new(category, error.to_string(), context);
    classified.cause = Some(Arc::new(error));
    classified
}

/// Category for a raw error. First matching rule wins:
/// cancellation and deadlines, network, process exit, OS I/O, typed
/// protocol errors, then message heuristics.
#[must_use]
pub fn categorize(error: &Error, context: &ErrorContext) -> ErrorCategory {
    match error {
        Error::Cancelled => ErrorCategory::ClientUsage,
        Error::Timeout(_) => ErrorCategory::Timeout,

        Error::Http(e) => categorize_reqwest(e, context),
        Error::HttpStatus { status, .. } => categorize_status(*status),

        Error::ProcessExited { .. } if context.during_connect => ErrorCategory::ServerStartup,
        Error::ProcessExited { .. } => ErrorCategory::ServerUnavailable,

        Error::Spawn { source, .. } => {
            if is_fd_exhaustion(source) {
                ErrorCategory::ClientResource
            } else {
                ErrorCategory::ServerStartup
            }
        }
        Error::Io(e) => categorize_io(e, context),

        Error::Json(_) => ErrorCategory::Serialization,
        Error::JsonRpc { code, .. } => categorize_rpc_code(*code),
        Error::Protocol(_) => ErrorCategory::Protocol,
        Error::Config(_) | Error::UnsafeCommand(_) | Error::UnsupportedTransport(_) => {
            ErrorCategory::ClientConfig
        }
        Error::NotConnected
        | Error::AlreadyConnected
        | Error::ConnectInProgress
        | Error::Closed => ErrorCategory::ClientUsage,

        Error::TransportClosed(msg) | Error::Transport(msg) => {
            categorize_text(msg).unwrap_or(ErrorCategory::Transport)
        }
        Error::Internal(msg) => categorize_text(msg).unwrap_or(ErrorCategory::Unknown),
    }
}

fn categorize_reqwest(e: &reqwest::Error, context: &ErrorContext) -> ErrorCategory {
    if e.is_timeout() {
        return ErrorCategory::Timeout;
    }
    if e.is_connect() {
        return ErrorCategory::Connection;
    }
    if let Some(status) = e.status() {
        return categorize_status(status.as_u16());
    }
    if e.is_decode() {
        return ErrorCategory::Serialization;
    }
    if let Some(io) = find_io_error(e) {
        return categorize_io(io, context);
    }
    categorize_text(&e.to_string()).unwrap_or(ErrorCategory::Transport)
}

fn find_io_error<'a>(e: &'a (dyn std::error::Error + 'static)) -> Option<&'a io::Error> {
    let mut current = Some(e);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return Some(io);
        }
        current = err.source();
    }
    None
}

fn categorize_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 | 407 => ErrorCategory::Authentication,
        408 => ErrorCategory::Timeout,
        400 | 422 => ErrorCategory::Validation,
        404 | 410 | 429 | 502 | 503 | 504 => ErrorCategory::ServerUnavailable,
        405 | 501 => ErrorCategory::ServerCapability,
        500..=599 => ErrorCategory::ServerInternal,
        _ => ErrorCategory::Protocol,
    }
}

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == nix::errno::Errno::EMFILE as i32 || code == nix::errno::Errno::ENFILE as i32
    )
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}

fn categorize_io(e: &io::Error, context: &ErrorContext) -> ErrorCategory {
    if is_fd_exhaustion(e) {
        return ErrorCategory::ClientResource;
    }
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable => ErrorCategory::Connection,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected => ErrorCategory::Transport,
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            if context.transport == Some(TransportKind::Stdio) || context.during_connect {
                ErrorCategory::ServerStartup
            } else {
                ErrorCategory::ClientConfig
            }
        }
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorCategory::Timeout,
        io::ErrorKind::OutOfMemory => ErrorCategory::ClientResource,
        io::ErrorKind::InvalidData => ErrorCategory::Serialization,
        _ => categorize_text(&e.to_string()).unwrap_or(ErrorCategory::Transport),
    }
}

fn categorize_rpc_code(code: i32) -> ErrorCategory {
    match code {
        rpc_codes::PARSE_ERROR => ErrorCategory::Serialization,
        rpc_codes::INVALID_REQUEST => ErrorCategory::Protocol,
        rpc_codes::METHOD_NOT_FOUND => ErrorCategory::ServerCapability,
        rpc_codes::INVALID_PARAMS => ErrorCategory::Validation,
        rpc_codes::INTERNAL_ERROR => ErrorCategory::ServerInternal,
        rpc_codes::SERVER_ERROR_END..=rpc_codes::SERVER_ERROR_START => {
            ErrorCategory::ServerInternal
        }
        _ => ErrorCategory::Unknown,
    }
}

/// Last-resort keyword matching on free-form messages
fn categorize_text(message: &str) -> Option<ErrorCategory> {
    let text = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&["timed out", "timeout", "deadline"]) {
        Some(ErrorCategory::Timeout)
    } else if has(&["connection refused", "econnrefused", "dns", "failed to lookup", "unreachable"]) {
        Some(ErrorCategory::Connection)
    } else if has(&["connection reset", "econnreset", "broken pipe", "unexpected eof"]) {
        Some(ErrorCategory::Transport)
    } else if has(&["failed to start", "spawn", "startup", "no such file"]) {
        Some(ErrorCategory::ServerStartup)
    } else if has(&["protocol", "json-rpc", "jsonrpc"]) {
        Some(ErrorCategory::Protocol)
    } else if has(&["serializ", "deserializ", "parse error", "invalid json"]) {
        Some(ErrorCategory::Serialization)
    } else if has(&["unauthorized", "forbidden", "authenticat", "credential"]) {
        Some(ErrorCategory::Authentication)
    } else if has(&["capabilit", "not supported", "method not found"]) {
        Some(ErrorCategory::ServerCapability)
    } else if has(&["invalid", "validation", "required"]) {
        Some(ErrorCategory::Validation)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> ErrorContext {
        ErrorContext::operation("list_tools")
    }

    #[test]
    fn category_table() {
        use ErrorCategory as C;
        let expected = [
            (C::Connection, Severity::Error, Some(2_000)),
            (C::Transport, Severity::Error, Some(500)),
            (C::Timeout, Severity::Warning, Some(1_000)),
            (C::ServerUnavailable, Severity::Error, Some(5_000)),
            (C::ServerInternal, Severity::Error, Some(3_000)),
            (C::Authentication, Severity::Error, None),
            (C::Protocol, Severity::Error, None),
            (C::Serialization, Severity::Error, None),
            (C::Validation, Severity::Warning, None),
            (C::ServerCapability, Severity::Warning, None),
            (C::ClientUsage, Severity::Warning, None),
            (C::ServerStartup, Severity::Critical, None),
            (C::ClientResource, Severity::Critical, None),
            (C::ClientConfig, Severity::Error, None),
            (C::Unknown, Severity::Error, None),
        ];
        for (category, severity, delay_ms) in expected {
            assert_eq!(category.severity(), severity, "{category}");
            assert_eq!(
                category.default_retry_delay(),
                delay_ms.map(Duration::from_millis),
                "{category}"
            );
            assert_eq!(category.is_recoverable(), delay_ms.is_some(), "{category}");
        }
    }

    #[test]
    fn category_names_round_trip() {
        for category in ErrorCategory::ALL {
            assert_eq!(category.as_str().parse::<ErrorCategory>(), Ok(category));
            assert_eq!(
                serde_json::to_value(category).unwrap(),
                Value::String(category.as_str().to_string())
            );
        }
    }

    #[test]
    fn cancellation_is_client_usage_and_not_retried() {
        let c = classify(Error::Cancelled, &ctx());
        assert_eq!(c.category(), ErrorCategory::ClientUsage);
        assert!(!c.is_recoverable());
    }

    #[test]
    fn unsafe_command_is_client_config() {
        let c = classify(
            Error::UnsafeCommand("dangerous pattern \";\" in command".into()),
            &ErrorContext::connecting(TransportKind::Stdio),
        );
        assert_eq!(c.category(), ErrorCategory::ClientConfig);
        assert!(c.message().contains("dangerous pattern"));
        assert_eq!(c.operation(), Some("connect"));
        assert!(matches!(c.cause(), Some(Error::UnsafeCommand(_))));
    }

    #[test]
    fn process_exit_depends_on_phase() {
        let exit = || Error::ProcessExited { pid: 1, code: Some(1) };
        assert_eq!(
            categorize(&exit(), &ErrorContext::connecting(TransportKind::Stdio)),
            ErrorCategory::ServerStartup
        );
        assert_eq!(categorize(&exit(), &ctx()), ErrorCategory::ServerUnavailable);
    }

    #[test]
    fn spawn_not_found_is_startup() {
        let err = Error::Spawn {
            command: "nope".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(categorize(&err, &ctx()), ErrorCategory::ServerStartup);
    }

    #[test]
    fn io_kinds() {
        let io = |kind| Error::Io(io::Error::from(kind));
        assert_eq!(
            categorize(&io(io::ErrorKind::ConnectionRefused), &ctx()),
            ErrorCategory::Connection
        );
        assert_eq!(
            categorize(&io(io::ErrorKind::BrokenPipe), &ctx()),
            ErrorCategory::Transport
        );
        assert_eq!(
            categorize(&io(io::ErrorKind::TimedOut), &ctx()),
            ErrorCategory::Timeout
        );
    }

    #[cfg(unix)]
    #[test]
    fn fd_exhaustion_is_client_resource() {
        let err = Error::Io(io::Error::from_raw_os_error(nix::errno::Errno::EMFILE as i32));
        assert_eq!(categorize(&err, &ctx()), ErrorCategory::ClientResource);
    }

    #[test]
    fn http_statuses() {
        let status = |status| Error::HttpStatus {
            status,
            body: String::new(),
        };
        assert_eq!(categorize(&status(401), &ctx()), ErrorCategory::Authentication);
        assert_eq!(categorize(&status(503), &ctx()), ErrorCategory::ServerUnavailable);
        assert_eq!(categorize(&status(500), &ctx()), ErrorCategory::ServerInternal);
        assert_eq!(categorize(&status(429), &ctx()), ErrorCategory::ServerUnavailable);
    }

    #[test]
    fn json_rpc_codes() {
        let rpc = |code| Error::json_rpc(code, "x");
        assert_eq!(categorize(&rpc(-32601), &ctx()), ErrorCategory::ServerCapability);
        assert_eq!(categorize(&rpc(-32602), &ctx()), ErrorCategory::Validation);
        assert_eq!(categorize(&rpc(-32603), &ctx()), ErrorCategory::ServerInternal);
        assert_eq!(categorize(&rpc(-32700), &ctx()), ErrorCategory::Serialization);
    }

    #[test]
    fn text_heuristics_fall_back_to_unknown() {
        assert_eq!(
            categorize(&Error::Internal("upstream timed out".into()), &ctx()),
            ErrorCategory::Timeout
        );
        assert_eq!(
            categorize(&Error::Internal("connection refused by peer".into()), &ctx()),
            ErrorCategory::Connection
        );
        assert_eq!(
            categorize(&Error::Internal("something odd".into()), &ctx()),
            ErrorCategory::Unknown
        );
        assert_eq!(
            categorize(&Error::TransportClosed("event stream ended".into()), &ctx()),
            ErrorCategory::Transport
        );
    }

    #[test]
    fn not_connected_is_descriptive_usage_error() {
        let c = classify(Error::NotConnected, &ErrorContext::operation("list_tools"));
        assert_eq!(c.category(), ErrorCategory::ClientUsage);
        assert!(c.message().contains("connect"));
        assert_eq!(c.rpc_code(), rpc_codes::NOT_CONNECTED);
    }

    #[test]
    fn data_member_carries_guidance() {
        let c = classify(Error::Timeout(Duration::from_secs(1)), &ctx());
        let data = c.to_data();
        assert_eq!(data["category"], "timeout");
        assert_eq!(data["recoverable"], true);
        assert!(data["recoveryActions"].as_array().is_some_and(|a| !a.is_empty()));
        assert_eq!(c.rpc_code(), rpc_codes::TIMEOUT);
    }
}
