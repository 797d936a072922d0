//! Process-group spawn and signal delivery.

use crate::ProcessError;
use std::ffi::OsStr;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination request.
    Term,
    /// Forced termination.
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// How a group termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Nothing was alive when we got there.
    AlreadyGone,
    /// Exited within the grace window after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

/// Command whose child becomes the leader of a new process group (pgid == pid).
pub fn command_in_new_group(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(unix)]
fn check(rc: libc::c_int, pid: u32) -> Result<(), ProcessError> {
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(ProcessError::NotFound(pid)),
        Some(libc::EPERM) => Err(ProcessError::PermissionDenied(pid)),
        _ => Err(ProcessError::Io(err)),
    }
}

/// Send `signal` to a single process.
#[cfg(unix)]
pub fn signal_pid(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal.raw()) };
    check(rc, pid)
}

#[cfg(not(unix))]
pub fn signal_pid(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    let mut system = sysinfo::System::new();
    system.refresh_processes();
    let process = system
        .process(sysinfo::Pid::from_u32(pid))
        .ok_or(ProcessError::NotFound(pid))?;
    let delivered = match signal {
        Signal::Term => process
            .kill_with(sysinfo::Signal::Term)
            .unwrap_or_else(|| process.kill()),
        Signal::Kill => process.kill(),
    };
    if delivered {
        Ok(())
    } else {
        Err(ProcessError::PermissionDenied(pid))
    }
}

/// Send `signal` to every process in the group.
#[cfg(unix)]
pub fn signal_group(pgid: i32, signal: Signal) -> Result<(), ProcessError> {
    if pgid <= 1 {
        return Err(ProcessError::NotFound(pgid.max(0) as u32));
    }
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal.raw()) };
    check(rc, pgid as u32)
}

/// Without process groups the leader is the best we can do.
#[cfg(not(unix))]
pub fn signal_group(pgid: i32, signal: Signal) -> Result<(), ProcessError> {
    if pgid <= 0 {
        return Err(ProcessError::NotFound(0));
    }
    signal_pid(pgid as u32, signal)
}

/// Whether a process with this pid exists (it may belong to another user).
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    !matches!(check(rc, pid), Err(ProcessError::NotFound(_)))
}

#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    let mut system = sysinfo::System::new();
    system.refresh_processes();
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// Process group of the calling process.
#[cfg(unix)]
pub fn own_process_group() -> Option<i32> {
    let pgid = unsafe { libc::getpgrp() };
    (pgid > 0).then_some(pgid)
}

#[cfg(not(unix))]
pub fn own_process_group() -> Option<i32> {
    None
}

#[cfg(unix)]
fn group_alive(pgid: i32) -> bool {
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, 0) };
    !matches!(check(rc, pgid as u32), Err(ProcessError::NotFound(_)))
}

#[cfg(not(unix))]
fn group_alive(pgid: i32) -> bool {
    is_alive(pgid as u32)
}

/// SIGTERM the group, wait up to `grace`, then SIGKILL whatever is left.
pub async fn terminate_group(pgid: i32, grace: Duration) -> Result<TerminateOutcome, ProcessError> {
    match signal_group(pgid, Signal::Term) {
        Ok(()) => {}
        Err(ProcessError::NotFound(_)) => return Ok(TerminateOutcome::AlreadyGone),
        Err(e) => return Err(e),
    }
    tracing::debug!(pgid, "sent SIGTERM to process group");

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !group_alive(pgid) {
            return Ok(TerminateOutcome::Terminated);
        }
        tokio::time::sleep(POLL).await;
    }

    match signal_group(pgid, Signal::Kill) {
        Ok(()) => {
            tracing::warn!(pgid, grace_secs = grace.as_secs(), "process group ignored SIGTERM, killed");
            Ok(TerminateOutcome::Killed)
        }
        Err(ProcessError::NotFound(_)) => Ok(TerminateOutcome::Terminated),
        Err(e) => Err(e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn terminates_whole_group() {
        let mut child = command_in_new_group("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(is_alive(pid));

        let outcome = terminate_group(pid as i32, Duration::from_millis(500))
            .await
            .unwrap();
        assert_ne!(outcome, TerminateOutcome::AlreadyGone);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn missing_group_is_already_gone() {
        let mut child = command_in_new_group("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        let outcome = terminate_group(pid as i32, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome, TerminateOutcome::AlreadyGone);
    }
}
