//! Unix socket JSON-RPC server

use std::io;
use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectParams, MAX_LINE_LENGTH, methods};
use crate::classify::{ClassifiedError, ErrorContext};
use crate::error::rpc_codes;
use crate::protocol::{JSONRPC_VERSION, JsonRpcResponse, RequestId};
use crate::service::McpService;
use crate::{Error, Result};

/// Socket file mode: owner read/write only
const SOCKET_MODE: u32 = 0o600;

/// Daemon bound to a socket path
pub struct DaemonServer {
    service: McpService,
    listener: UnixListener,
    socket_path: PathBuf,
    shutdown: CancellationToken,
}

impl DaemonServer {
    /// Bind the socket, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// `Error::Config` when the path exists and is not a socket, `Error::Io`
    /// when binding fails.
    pub fn bind(service: McpService, socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        remove_stale_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        }
        info!(socket_path = %socket_path.display(), "Daemon listening");

        Ok(Self {
            service,
            listener,
            socket_path,
            shutdown: CancellationToken::new(),
        })
    }

    /// Path of the bound socket
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Cancelling this token stops the daemon
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until shutdown, then close the session and remove the socket
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("Daemon client connected");
                        tokio::spawn(serve_connection(
                            stream,
                            self.service.clone(),
                            self.shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept daemon connection"),
                },
            }
        }

        info!("Daemon shutting down");
        self.service.shutdown().await;
        Ok(())
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(socket_path = %self.socket_path.display(), "Removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove socket file"),
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            debug!(path = %path.display(), "Removed stale socket file");
            Ok(())
        }
        Ok(_) => Err(Error::Config(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

async fn serve_connection(stream: UnixStream, service: McpService, shutdown: CancellationToken) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = framed.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(error = %e, "Daemon connection read failed");
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let Some(response) = handle_line(&service, &shutdown, &line).await else {
            continue;
        };
        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode daemon response");
                break;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            warn!(error = %e, "Daemon connection write failed");
            break;
        }
    }
    debug!("Daemon client disconnected");
}

/// Handle one line; `None` for notifications
async fn handle_line(
    service: &McpService,
    shutdown: &CancellationToken,
    line: &str,
) -> Option<JsonRpcResponse> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Some(JsonRpcResponse::error(
                None,
                rpc_codes::PARSE_ERROR,
                format!("Parse error: {e}"),
            ));
        }
    };

    let (id, method, params) = match parse_request(&value) {
        Ok(parsed) => parsed,
        Err(response) => return Some(response),
    };

    debug!(method = %method, id = ?id, "Daemon request");
    let outcome = dispatch(service, shutdown, &method, params).await;
    let id = id?;

    Some(match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(Failure::Rpc(code, message)) => JsonRpcResponse::error(Some(id), code, message),
        Err(Failure::Classified(e)) => {
            JsonRpcResponse::error_with_data(Some(id), e.rpc_code(), e.message(), e.to_data())
        }
    })
}

fn parse_request(
    value: &Value,
) -> std::result::Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    let id = match value.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(serde_json::from_value::<RequestId>(raw.clone()).map_err(|_| {
            JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Invalid id")
        })?),
    };

    if value.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(JsonRpcResponse::error(
            id,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method"))?;

    Ok((id, method.to_string(), value.get("params").cloned()))
}

enum Failure {
    Rpc(i32, String),
    Classified(ClassifiedError),
}

impl From<ClassifiedError> for Failure {
    fn from(e: ClassifiedError) -> Self {
        Self::Classified(e)
    }
}

fn params<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, Failure> {
    let value = match params {
        None | Some(Value::Null) => json!({}),
        Some(value) => value,
    };
    serde_json::from_value(value)
        .map_err(|e| Failure::Rpc(rpc_codes::INVALID_PARAMS, format!("Invalid params: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> std::result::Result<Value, Failure> {
    serde_json::to_value(value)
        .map_err(|e| Failure::Rpc(rpc_codes::INTERNAL_ERROR, format!("Failed to encode result: {e}")))
}

#[derive(serde::Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(serde::Deserialize)]
struct ReadResourceParams {
    uri: String,
}

#[derive(serde::Deserialize)]
struct GetPromptParams {
    name: String,
    #[serde(default)]
    arguments: std::collections::HashMap<String, String>,
}

async fn dispatch(
    service: &McpService,
    shutdown: &CancellationToken,
    method: &str,
    raw: Option<Value>,
) -> std::result::Result<Value, Failure> {
    match method {
        methods::CONNECT => {
            let request: ConnectParams = params(raw)?;
            let descriptor = request.to_descriptor().map_err(|e| {
                service
                    .manager()
                    .fail(e, &ErrorContext::operation("connect"))
            })?;
            to_value(&service.connect(descriptor).await?)
        }
        methods::DISCONNECT => {
            service.disconnect().await?;
            Ok(json!({ "connected": false }))
        }
        methods::IS_CONNECTED => Ok(json!({ "connected": service.is_connected() })),
        methods::LIST_TOOLS => Ok(json!({ "tools": to_value(&service.list_tools().await?)? })),
        methods::CALL_TOOL => {
            let request: CallToolParams = params(raw)?;
            to_value(&service.call_tool(&request.name, request.arguments).await?)
        }
        methods::LIST_RESOURCES => Ok(json!({
            "resources": to_value(&service.list_resources().await?)?
        })),
        methods::READ_RESOURCE => {
            let request: ReadResourceParams = params(raw)?;
            Ok(json!({ "contents": to_value(&service.read_resource(&request.uri).await?)? }))
        }
        methods::LIST_PROMPTS => Ok(json!({ "prompts": to_value(&service.list_prompts().await?)? })),
        methods::GET_PROMPT => {
            let request: GetPromptParams = params(raw)?;
            to_value(&service.get_prompt(&request.name, request.arguments).await?)
        }
        methods::SERVER_INFO => to_value(&service.server_info()?),
        methods::PING => Ok(json!({ "latencyMs": service.ping().await? })),
        methods::DIAGNOSTICS => to_value(&service.diagnostics()),
        methods::SHUTDOWN => {
            info!("Shutdown requested by daemon client");
            shutdown.cancel();
            Ok(json!({ "shuttingDown": true }))
        }
        other => Err(Failure::Rpc(
            rpc_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}
