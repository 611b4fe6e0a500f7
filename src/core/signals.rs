//! # OS signal handling for master and worker processes.
//!
//! **Master** ([`MasterSignals`]):
//! - `SIGINT`, `SIGTERM`, `SIGHUP`, `SIGQUIT` → graceful stop
//! - `SIGUSR1` → reload
//! - `SIGCHLD` is owned by the [reaper](crate::core::reaper), not by this stream
//!
//! **Worker** ([`WorkerSignals`]):
//! - `SIGTERM` → graceful stop
//! - `SIGUSR1` → graceful reload
//! - `SIGINT`, `SIGHUP` → swallowed; a Ctrl-C in the terminal reaches the whole
//!   process group, and the master decides how its children stop
//!
//! Listeners are registered once per process and reused for every `recv`.

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::error::RuntimeError;

fn listen(kind: SignalKind) -> Result<Signal, RuntimeError> {
    signal(kind).map_err(|source| RuntimeError::Signal { source })
}

/// Request derived from a master signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterSignal {
    /// Graceful stop; carries the signal name.
    Stop(&'static str),
    /// Reload every reloadable worker.
    Reload,
}

/// Signal streams of the master process.
pub struct MasterSignals {
    int: Signal,
    term: Signal,
    hup: Signal,
    quit: Signal,
    usr1: Signal,
}

impl MasterSignals {
    /// Registers the master listeners.
    pub fn install() -> Result<Self, RuntimeError> {
        Ok(Self {
            int: listen(SignalKind::interrupt())?,
            term: listen(SignalKind::terminate())?,
            hup: listen(SignalKind::hangup())?,
            quit: listen(SignalKind::quit())?,
            usr1: listen(SignalKind::user_defined1())?,
        })
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> MasterSignal {
        tokio::select! {
            _ = self.int.recv()  => MasterSignal::Stop("SIGINT"),
            _ = self.term.recv() => MasterSignal::Stop("SIGTERM"),
            _ = self.hup.recv()  => MasterSignal::Stop("SIGHUP"),
            _ = self.quit.recv() => MasterSignal::Stop("SIGQUIT"),
            _ = self.usr1.recv() => MasterSignal::Reload,
        }
    }
}

/// Request derived from a worker signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Graceful stop with exit code 0.
    Stop,
    /// Graceful reload.
    Reload,
}

/// Signal streams of a worker process.
pub struct WorkerSignals {
    term: Signal,
    usr1: Signal,
    int: Signal,
    hup: Signal,
}

impl WorkerSignals {
    /// Registers the worker listeners.
    pub fn install() -> Result<Self, RuntimeError> {
        Ok(Self {
            term: listen(SignalKind::terminate())?,
            usr1: listen(SignalKind::user_defined1())?,
            int: listen(SignalKind::interrupt())?,
            hup: listen(SignalKind::hangup())?,
        })
    }

    /// Waits for the next stop or reload signal.
    pub async fn recv(&mut self) -> WorkerSignal {
        loop {
            tokio::select! {
                _ = self.term.recv() => return WorkerSignal::Stop,
                _ = self.usr1.recv() => return WorkerSignal::Reload,
                _ = self.int.recv() => tracing::debug!("SIGINT ignored by worker"),
                _ = self.hup.recv() => tracing::debug!("SIGHUP ignored by worker"),
            }
        }
    }
}
