//! Stdio transport (child process)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::{CloseReason, Inbox, JsonRpcCodec, Transport, TransportKind};
use crate::process::{ManagedProcess, ProcessManager, ProcessSpec};
use crate::protocol::JsonRpcMessage;
use crate::Result;

/// How long the reader waits for an exit status after stdout closes
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(500);

/// Stdio transport for subprocess MCP servers
pub struct StdioTransport {
    process: Arc<ManagedProcess>,
    process_manager: Arc<ProcessManager>,
    writer: Mutex<Option<FramedWrite<ChildStdin, JsonRpcCodec>>>,
    inbox: Arc<Inbox>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Validate and spawn the server, then start the reader tasks.
    ///
    /// No await point separates the spawn from the transport taking
    /// ownership, so a cancelled connect cannot strand the child.
    ///
    /// # Errors
    ///
    /// Validation and spawn errors from [`ProcessManager::start`].
    pub fn spawn(process_manager: &Arc<ProcessManager>, spec: &ProcessSpec) -> Result<Arc<Self>> {
        let (process, stdio) = process_manager.start(spec)?;
        let inbox = Inbox::new();

        tokio::spawn(read_stdout(
            stdio.stdout,
            Arc::clone(&process),
            Arc::clone(&inbox),
        ));
        if let Some(stderr) = stdio.stderr {
            tokio::spawn(drain_stderr(stderr, process.pid()));
        }

        Ok(Arc::new(Self {
            process,
            process_manager: Arc::clone(process_manager),
            writer: Mutex::new(Some(FramedWrite::new(stdio.stdin, JsonRpcCodec::new()))),
            inbox,
            closed: AtomicBool::new(false),
        }))
    }

    /// The server process backing this transport
    #[must_use]
    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }
}

async fn read_stdout(stdout: ChildStdout, process: Arc<ManagedProcess>, inbox: Arc<Inbox>) {
    let pid = process.pid();
    let mut frames = FramedRead::new(stdout, JsonRpcCodec::new());

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(message) => {
                if inbox.push(message).await.is_err() {
                    debug!(pid, "Inbox closed; stdout reader stopping");
                    return;
                }
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to read server output");
                break;
            }
        }
    }

    // stdout closed: the process is gone or about to be
    let code = process.wait(Some(EXIT_STATUS_WAIT)).await.ok().flatten();
    debug!(pid, exit_code = ?code, "Server stdout closed");
    inbox.close(CloseReason::Exited { pid, code });
}

async fn drain_stderr(stderr: ChildStderr, pid: u32) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(pid, stderr = %line, "Server stderr"),
            Ok(None) => break,
            Err(e) => {
                debug!(pid, error = %e, "Stopped reading server stderr");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(framed) = writer.as_mut() else {
            return Err(self.inbox.closed_error());
        };
        if let Err(e) = framed.send(message).await {
            // A dead child shows up as EPIPE; report why it died instead
            if self.inbox.is_closed() || !self.process.is_running() {
                return Err(self.inbox.closed_error());
            }
            return Err(e);
        }
        Ok(())
    }

    async fn receive(&self, deadline: Option<Duration>) -> Result<JsonRpcMessage> {
        self.inbox.recv(deadline).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping stdin gives well-behaved servers an EOF to exit on
        self.writer.lock().await.take();
        self.inbox
            .close(CloseReason::Other("transport closed".to_string()));

        let pid = self.process.pid();
        self.process_manager.kill(pid).await?;
        self.process_manager.cleanup();
        debug!(pid, "Stdio transport closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.inbox.is_closed() && self.process.is_running()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) && self.process.is_running() {
            warn!(pid = self.process.pid(), "Stdio transport dropped without close");
        }
    }
}
