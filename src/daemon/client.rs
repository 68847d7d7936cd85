//! Client side of the daemon socket

use std::path::Path;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::trace;

use super::MAX_LINE_LENGTH;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::{Error, Result};

/// Connection to a running daemon. Requests are sequential; ids increase
/// monotonically and every response must echo its request's id.
pub struct DaemonClient {
    framed: Framed<UnixStream, LinesCodec>,
    next_id: i64,
}

impl DaemonClient {
    /// Connect to the daemon socket
    ///
    /// # Errors
    ///
    /// `Error::Transport` when nothing listens on `path`.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            Error::Transport(format!(
                "cannot reach daemon at {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            next_id: 1,
        })
    }

    /// Send one request and wait for its response
    ///
    /// # Errors
    ///
    /// `Error::JsonRpc` for error replies (with the classification in
    /// `data`), `Error::Protocol` when the echoed id does not match.
    pub async fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);
        trace!(id, method, "Daemon request");
        self.framed
            .send(serde_json::to_string(&request)?)
            .await
            .map_err(codec_error)?;

        let line = self
            .framed
            .next()
            .await
            .ok_or_else(|| Error::TransportClosed("daemon closed the connection".to_string()))?
            .map_err(codec_error)?;
        let response: JsonRpcResponse = serde_json::from_str(&line)?;

        if response.id != Some(RequestId::Number(id)) {
            return Err(Error::Protocol(format!(
                "daemon answered id {} to request {id}",
                response
                    .id
                    .map_or_else(|| "null".to_string(), |r| r.to_string())
            )));
        }
        if let Some(error) = response.error {
            return Err(Error::JsonRpc {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Protocol("daemon message exceeds the maximum line length".to_string())
        }
    }
}
