//! POSIX process-group signaling

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use super::Delivery;
use crate::Result;

/// Nothing to hold on POSIX: the process group is the handle
pub(super) struct Guard;

/// Put the child in a fresh process group whose id equals its pid
pub(super) fn configure(cmd: &mut Command) {
    cmd.process_group(0);
}

pub(super) fn attach(_child: &Child) -> Result<Guard> {
    Ok(Guard)
}

/// SIGTERM to the whole group
pub(super) fn request_stop(pid: u32, _guard: &mut Option<Guard>) -> Delivery {
    signal_group(pid, Signal::SIGTERM)
}

/// SIGKILL to the whole group
pub(super) fn force_stop(pid: u32, _guard: &mut Option<Guard>) -> Delivery {
    signal_group(pid, Signal::SIGKILL)
}

fn signal_group(pid: u32, signal: Signal) -> Delivery {
    let Ok(raw) = i32::try_from(pid) else {
        return Delivery::Failed(format!("pid {pid} out of range"));
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => Delivery::Sent,
        Err(Errno::ESRCH) => Delivery::AlreadyGone,
        Err(e) => Delivery::Failed(format!("{signal} to group {pid}: {e}")),
    }
}
