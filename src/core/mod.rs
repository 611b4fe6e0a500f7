//! Runtime core: master lifecycle, pool and supervision.
//!
//! - `master`: the [`Server`] state machine and command handlers;
//! - `builder`: [`ServerBuilder`];
//! - `supervisor`: spawn, reap, monitor, stop and reload of workers;
//! - `pool`: worker definitions and live process records;
//! - `launcher`: how children are created and signalled;
//! - `reaper`: `SIGCHLD` draining;
//! - `signals`: master and worker signal streams;
//! - `status`: the shared [`ServerStatus`] cell;
//! - `config`, `container`, `plugin`.

mod builder;
mod config;
mod container;
mod launcher;
mod master;
mod plugin;
mod pool;
pub(crate) mod reaper;
pub(crate) mod signals;
mod status;
mod supervisor;

pub use builder::ServerBuilder;
pub use config::ServerConfig;
pub use container::Container;
pub use launcher::{ExecLauncher, Launcher, ProcessSignal, ENV_SOCKET, ENV_WORKER};
pub use master::{report_fatal, Server};
pub use plugin::{Plugin, PluginRef};
pub use pool::{Pool, ProcessRecord};
pub use reaper::drain_exited;
pub use status::{ServerStatus, StatusCell};
pub use supervisor::{StopHandle, StopOutcome, Supervisor};
