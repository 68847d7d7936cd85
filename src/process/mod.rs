//! Local server process management
//!
//! The [`ProcessManager`] is the only owner of spawned children. Callers get
//! an `Arc<ManagedProcess>` handle exposing pid, liveness, exit code, `kill`
//! and `wait`, never the OS handle itself.
//!
//! - **POSIX**: every child leads its own process group; `kill` sends
//!   SIGTERM to the group, waits the grace period, then SIGKILL, then gives up
//!   after the kill timeout and marks the process finished anyway.
//! - **Windows**: every child is assigned to a job object that kills all
//!   members when closed.
//! - A reaper task polls `try_wait` on a fixed tick so exited children never
//!   linger as zombies, whether or not anyone calls `wait`.

mod validate;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

pub use validate::{CommandPolicy, DANGEROUS_PATTERNS, validate_command};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::{Error, Result};

/// Outcome of delivering a stop request to a process (group)
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Signal delivered
    Sent,
    /// Target no longer exists
    AlreadyGone,
    /// Delivery failed for another reason
    Failed(String),
}

/// What to spawn
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Executable (resolved through `PATH`)
    pub command: String,
    /// Ordered arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    /// Spec for `command args...`
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }
}

/// Pipes of a freshly spawned child
#[derive(Debug)]
pub struct ProcessStdio {
    /// Child stdin
    pub stdin: ChildStdin,
    /// Child stdout
    pub stdout: ChildStdout,
    /// Child stderr
    pub stderr: Option<ChildStderr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    Running,
    Exited(Option<i32>),
}

/// A tracked child process
pub struct ManagedProcess {
    pid: u32,
    command: String,
    args: Vec<String>,
    started_at: DateTime<Utc>,
    child: Mutex<Option<Child>>,
    guard: Mutex<Option<platform::Guard>>,
    state: watch::Sender<ExitState>,
    poll_interval: Duration,
    grace_period: Duration,
    kill_timeout: Duration,
}

impl ManagedProcess {
    /// OS process id
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Command the process was started with
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Arguments the process was started with
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Spawn time
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// False once termination has been observed; never flips back
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.state.borrow() == ExitState::Running
    }

    /// Exit code once known (`None` while running or when killed by a signal)
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match *self.state.borrow() {
            ExitState::Exited(code) => code,
            ExitState::Running => None,
        }
    }

    /// Non-blocking status poll. Returns true if the process is finished.
    pub(crate) fn try_reap(&self) -> bool {
        let status = {
            let mut child = self.child.lock();
            let Some(inner) = child.as_mut() else {
                return !self.is_running();
            };
            match inner.try_wait() {
                Ok(Some(status)) => {
                    *child = None;
                    Some(Ok(status))
                }
                Ok(None) => None,
                Err(e) => {
                    *child = None;
                    Some(Err(e))
                }
            }
        };

        match status {
            Some(Ok(status)) => {
                self.mark_finished(exit_code_of(status));
                true
            }
            Some(Err(e)) => {
                // ECHILD and friends: the OS no longer knows this child
                debug!(pid = self.pid, error = %e, "try_wait failed; treating process as gone");
                self.mark_finished(None);
                true
            }
            None => !self.is_running(),
        }
    }

    fn mark_finished(&self, code: Option<i32>) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ExitState::Running {
                *state = ExitState::Exited(code);
                true
            } else {
                false
            }
        });
        if changed {
            debug!(pid = self.pid, command = %self.command, exit_code = ?code, "Process finished");
        }
    }

    /// Wait for the process to finish, up to `timeout` when given.
    ///
    /// Returns the exit code (`None` when killed by a signal). Waiting on a
    /// finished process returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the process is still running at the deadline.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Option<i32>> {
        let fut = self.wait_finished();
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Error::Timeout(limit)),
            None => Ok(fut.await),
        }
    }

    async fn wait_finished(&self) -> Option<i32> {
        let mut rx = self.state.subscribe();
        loop {
            if self.try_reap() {
                return self.exit_code();
            }
            tokio::select! {
                _ = rx.changed() => {}
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn wait_for(&self, limit: Duration) -> bool {
        self.wait(Some(limit)).await.is_ok()
    }

    /// Terminate the process (and its group), graceful first.
    ///
    /// Killing a finished process is a no-op. A process that survives
    /// SIGKILL for the kill timeout is marked finished regardless, so callers
    /// never block forever.
    pub async fn kill(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let delivery = platform::request_stop(self.pid, &mut self.guard.lock());
        match delivery {
            Delivery::AlreadyGone => {
                if self.try_reap() {
                    return Ok(());
                }
            }
            Delivery::Failed(reason) => {
                warn!(pid = self.pid, reason = %reason, "Graceful stop failed");
            }
            Delivery::Sent => debug!(pid = self.pid, "Sent graceful stop"),
        }

        if self.wait_for(self.grace_period).await {
            return Ok(());
        }

        warn!(
            pid = self.pid,
            grace_ms = self.grace_period.as_millis(),
            "Process ignored graceful stop, forcing"
        );
        let delivery = platform::force_stop(self.pid, &mut self.guard.lock());
        if delivery != Delivery::Sent {
            if let Some(child) = self.child.lock().as_mut() {
                let _ = child.start_kill();
            }
        }

        if self.wait_for(self.kill_timeout).await {
            return Ok(());
        }

        warn!(pid = self.pid, "Process did not exit after kill; marking finished");
        self.mark_finished(None);
        Ok(())
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("running", &self.is_running())
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

fn exit_code_of(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|s| 128 + s))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

type ProcessTable = Arc<Mutex<HashMap<u32, Arc<ManagedProcess>>>>;

/// Owner of every locally spawned server process
pub struct ProcessManager {
    processes: ProcessTable,
    config: ProcessConfig,
    policy: CommandPolicy,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessManager {
    /// Create a manager and start its reaper task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: ProcessConfig, policy: CommandPolicy) -> Arc<Self> {
        let processes: ProcessTable = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let reaper = tokio::spawn(reap_loop(
            Arc::clone(&processes),
            config.reap_interval,
            shutdown.clone(),
        ));

        Arc::new(Self {
            processes,
            config,
            policy,
            shutdown,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Command validation policy in force
    #[must_use]
    pub fn policy(&self) -> CommandPolicy {
        self.policy
    }

    /// Validate and spawn a process.
    ///
    /// Synchronous on purpose: there is no await point between the spawn and
    /// registration, so a cancelled caller can never leak an untracked child.
    ///
    /// # Errors
    ///
    /// [`Error::UnsafeCommand`]/[`Error::Config`] when validation fails (nothing
    /// is spawned), [`Error::Spawn`] when the OS refuses, [`Error::Closed`] after
    /// [`close`](Self::close).
    pub fn start(&self, spec: &ProcessSpec) -> Result<(Arc<ManagedProcess>, ProcessStdio)> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        validate_command(&spec.command, &spec.args, self.policy)?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        platform::configure(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            command: spec.command.clone(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Internal("spawned child has no pid".to_string()))?;

        let guard = match platform::attach(&child) {
            Ok(guard) => guard,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("Failed to get stdout".to_string()))?;
        let stderr = child.stderr.take();

        let (state, _) = watch::channel(ExitState::Running);
        let process = Arc::new(ManagedProcess {
            pid,
            command: spec.command.clone(),
            args: spec.args.clone(),
            started_at: Utc::now(),
            child: Mutex::new(Some(child)),
            guard: Mutex::new(Some(guard)),
            state,
            poll_interval: self.config.reap_interval,
            grace_period: self.config.grace_period,
            kill_timeout: self.config.kill_timeout,
        });

        self.processes.lock().insert(pid, Arc::clone(&process));
        info!(pid, command = %spec.command, args = ?spec.args, "Started server process");

        Ok((
            process,
            ProcessStdio {
                stdin,
                stdout,
                stderr,
            },
        ))
    }

    /// All tracked processes
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ManagedProcess>> {
        let mut all: Vec<_> = self.processes.lock().values().cloned().collect();
        all.sort_by_key(|p| p.pid);
        all
    }

    /// Look up a tracked process
    #[must_use]
    pub fn get(&self, pid: u32) -> Option<Arc<ManagedProcess>> {
        self.processes.lock().get(&pid).cloned()
    }

    /// Tracked processes not yet observed as finished
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.processes
            .lock()
            .values()
            .filter(|p| p.is_running())
            .count()
    }

    /// Kill a tracked process. Unknown or finished pids are a no-op.
    pub async fn kill(&self, pid: u32) -> Result<()> {
        let Some(process) = self.get(pid) else {
            debug!(pid, "Kill requested for untracked process; nothing to do");
            return Ok(());
        };
        process.kill().await
    }

    /// Kill every tracked process concurrently
    pub async fn kill_all(&self) {
        let running: Vec<_> = self.list().into_iter().filter(|p| p.is_running()).collect();
        if running.is_empty() {
            return;
        }
        info!(count = running.len(), "Killing all server processes");
        let kills = running.iter().map(|p| p.kill());
        for (process, result) in running.iter().zip(futures::future::join_all(kills).await) {
            if let Err(e) = result {
                warn!(pid = process.pid, error = %e, "Failed to kill process");
            }
        }
    }

    /// One reaper pass over all tracked processes. Returns how many finished
    /// during this pass.
    pub fn reap(&self) -> usize {
        reap_once(&self.processes)
    }

    /// Drop handles for processes that are no longer running.
    ///
    /// Returns the number of handles removed.
    pub fn cleanup(&self) -> usize {
        self.reap();
        let mut processes = self.processes.lock();
        let before = processes.len();
        processes.retain(|_, p| p.is_running());
        let removed = before - processes.len();
        if removed > 0 {
            debug!(removed, remaining = processes.len(), "Cleaned up finished processes");
        }
        removed
    }

    /// Kill everything and stop the reaper. Further `start` calls fail.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.kill_all().await;
        self.reap();
        self.processes.lock().clear();
        let reaper = self.reaper.lock().take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }
        debug!("Process manager closed");
    }

    /// Deadline used when stopping a process gracefully
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.config.grace_period
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        // Dropping a still-running `Child` kills it (kill_on_drop); take the
        // whole group down too so grandchildren are not orphaned.
        for process in self.processes.lock().values() {
            if process.is_running() {
                let _ = platform::force_stop(process.pid, &mut process.guard.lock());
            }
        }
    }
}

fn reap_once(processes: &ProcessTable) -> usize {
    let snapshot: Vec<_> = processes
        .lock()
        .values()
        .filter(|p| p.is_running())
        .cloned()
        .collect();
    snapshot.iter().filter(|p| p.try_reap()).count()
}

async fn reap_loop(processes: ProcessTable, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let started = Instant::now();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let reaped = reap_once(&processes);
                if reaped > 0 {
                    debug!(reaped, "Reaper collected exited processes");
                }
            }
        }
    }
    debug!(uptime_ms = started.elapsed().as_millis(), "Reaper stopped");
}
