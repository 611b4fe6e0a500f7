//! # Process launcher: how the supervisor creates and signals children.
//!
//! A child is never a fork of the running master. [`ExecLauncher`] starts a
//! fresh image of the current executable with the same arguments; the role
//! travels in the environment:
//!
//! ```text
//! master: Command(current_exe, args)
//!           .env(PROCVISOR_WORKER = <definition id>)
//!           .env(PROCVISOR_SOCKET = <bus socket>)      ──► spawn ──► pid
//! child:  main() ─► Server::run() ─► sees PROCVISOR_WORKER ─► WorkerProcess
//! ```
//!
//! The [`Launcher`] trait is the seam the supervisor talks to, so the
//! supervisor can be driven without real processes.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;

use crate::ipc::Pid;
use crate::workers::WorkerDefinition;

/// Environment variable carrying the worker definition id of a child.
pub const ENV_WORKER: &str = "PROCVISOR_WORKER";

/// Environment variable carrying the bus socket path of a child.
pub const ENV_SOCKET: &str = "PROCVISOR_SOCKET";

/// Signals the supervisor sends to children.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessSignal {
    /// Graceful stop (`SIGTERM`).
    Terminate,
    /// Graceful reload (`SIGUSR1`).
    Reload,
    /// Forced kill (`SIGKILL`).
    Kill,
}

impl ProcessSignal {
    /// OS signal delivered for this request.
    pub fn as_signal(self) -> Signal {
        match self {
            ProcessSignal::Terminate => Signal::SIGTERM,
            ProcessSignal::Reload => Signal::SIGUSR1,
            ProcessSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Creates worker processes and delivers signals to them.
pub trait Launcher: Send + Sync + 'static {
    /// Starts one process for `def`; returns its pid.
    fn spawn(&self, def: &WorkerDefinition) -> io::Result<Pid>;

    /// Sends `signal` to `pid`.
    fn signal(&self, pid: Pid, signal: ProcessSignal) -> io::Result<()>;
}

/// Launcher that re-executes the current binary in worker role.
#[derive(Clone, Debug)]
pub struct ExecLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    socket: PathBuf,
}

impl ExecLauncher {
    /// Launcher for the running executable with its original arguments.
    pub fn current(socket: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
            socket: socket.into(),
        })
    }

    /// Launcher for an explicit program.
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, socket: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            socket: socket.into(),
        }
    }
}

impl Launcher for ExecLauncher {
    fn spawn(&self, def: &WorkerDefinition) -> io::Result<Pid> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(ENV_WORKER, def.id().to_string())
            .env(ENV_SOCKET, &self.socket)
            .stdin(Stdio::null())
            .spawn()?;
        // The reaper collects the exit status with waitpid; the handle is not needed.
        Ok(child.id())
    }

    fn signal(&self, pid: Pid, signal: ProcessSignal) -> io::Result<()> {
        let pid = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        kill(NixPid::from_raw(pid), signal.as_signal()).map_err(io::Error::from)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_map_to_posix() {
        assert_eq!(ProcessSignal::Terminate.as_signal(), Signal::SIGTERM);
        assert_eq!(ProcessSignal::Reload.as_signal(), Signal::SIGUSR1);
        assert_eq!(ProcessSignal::Kill.as_signal(), Signal::SIGKILL);
    }

    #[test]
    fn signalling_a_missing_process_is_an_error() {
        let launcher = ExecLauncher::new("/bin/true", Vec::new(), "/tmp/none.sock");
        assert!(launcher.signal(i32::MAX as u32, ProcessSignal::Terminate).is_err());
    }
}
