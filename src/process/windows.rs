//! Job-object containment on Windows

use tokio::process::{Child, Command};
use win32job::Job;

use super::Delivery;
use crate::{Error, Result};

/// Job object configured to kill every member when its handle closes
pub(super) struct Guard(Job);

pub(super) fn configure(_cmd: &mut Command) {}

pub(super) fn attach(child: &Child) -> Result<Guard> {
    let handle = child
        .raw_handle()
        .ok_or_else(|| Error::Internal("child has no process handle".to_string()))?;

    let job = Job::create().map_err(|e| Error::Internal(format!("job object: {e}")))?;
    let mut info = job
        .query_extended_limit_info()
        .map_err(|e| Error::Internal(format!("job object: {e}")))?;
    info.limit_kill_on_job_close();
    job.set_extended_limit_info(&mut info)
        .map_err(|e| Error::Internal(format!("job object: {e}")))?;
    job.assign_process(handle as isize)
        .map_err(|e| Error::Internal(format!("job object: {e}")))?;

    Ok(Guard(job))
}

/// Windows has no polite group signal; closing the job is the stop
pub(super) fn request_stop(pid: u32, guard: &mut Option<Guard>) -> Delivery {
    force_stop(pid, guard)
}

pub(super) fn force_stop(_pid: u32, guard: &mut Option<Guard>) -> Delivery {
    match guard.take() {
        Some(Guard(job)) => {
            drop(job);
            Delivery::Sent
        }
        None => Delivery::AlreadyGone,
    }
}
