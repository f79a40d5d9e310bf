//! Process reaping
//!
//! The engine needs to know when an executor helper (or its `docker wait`
//! stand-in) terminates. Children spawned by this process are awaited
//! directly and yield a wait status; foreign pids reattached during recovery
//! can only be polled for existence, so their exit status is unobservable.

use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::Child;
use tracing::debug;

/// Interval between liveness probes of a foreign pid.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Whether a process with the given pid currently exists.
///
/// EPERM counts as alive: the process exists but belongs to someone else.
pub fn alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Wait for a child of this process to exit and return its raw wait status.
pub async fn reap_child(mut child: Child) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    match child.wait().await {
        Ok(status) => {
            debug!("Reaped child: {}", status);
            Some(status.into_raw())
        }
        Err(e) => {
            debug!("Failed to wait for child: {}", e);
            None
        }
    }
}

/// Poll a foreign pid until it disappears. The exit status is unknown.
pub async fn reap_pid(pid: i32) -> Option<i32> {
    while alive(pid) {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    debug!("Pid {} is gone", pid);
    None
}
