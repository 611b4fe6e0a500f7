//! # Child reaper.
//!
//! One `SIGCHLD` stream serves every child. Signals coalesce, so each
//! notification drains **all** terminated children with
//! `waitpid(-1, WNOHANG)` until none is left.
//!
//! Exit codes: a normal exit keeps its status; a death by signal maps to
//! `128 + signo`, as shells report it.

use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::supervisor::Supervisor;
use crate::error::RuntimeError;
use crate::ipc::Pid;

/// Maps a terminal wait status to `(pid, exit code)`.
fn exit_of(status: WaitStatus) -> Option<(Pid, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw() as Pid, code)),
        WaitStatus::Signaled(pid, signal, _core) => Some((pid.as_raw() as Pid, 128 + signal as i32)),
        _ => None,
    }
}

/// Collects every child that has terminated so far.
pub fn drain_exited() -> Vec<(Pid, i32)> {
    let mut exited = Vec::new();
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => exited.extend(exit_of(status)),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed");
                break;
            }
        }
    }
    exited
}

/// Starts the reaper task; every reaped child is handed to the supervisor.
pub(crate) fn spawn(
    supervisor: Arc<Supervisor>,
    token: CancellationToken,
) -> Result<JoinHandle<()>, RuntimeError> {
    let mut sigchld =
        signal(SignalKind::child()).map_err(|source| RuntimeError::Signal { source })?;

    Ok(tokio::spawn(async move {
        loop {
            for (pid, code) in drain_exited() {
                supervisor.handle_exit(pid, code);
            }
            tokio::select! {
                _ = token.cancelled() => break,
                received = sigchld.recv() => if received.is_none() { break },
            }
        }
    }))
}
