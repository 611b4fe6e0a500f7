//! # procvisor
//!
//! **Procvisor** is a single-host process supervisor for Rust.
//!
//! A long-lived master keeps a declared set of worker processes alive,
//! coordinates their startup, graceful stop and reload, and relays status and
//! control messages between itself, its children and CLI invocations over a
//! local socket.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   ┌───────────────────┐   ┌───────────────────┐
//!   │ WorkerDefinition  │   │ WorkerDefinition  │    count, reloadable, user/group,
//!   │  "http" count=3   │   │  "cron" count=1   │    callbacks, reload strategies
//!   └─────────┬─────────┘   └─────────┬─────────┘
//!             ▼                       ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Master process (Server)                  SHUTDOWN → STARTING →  │
//! │  - StatusCell (shared status)             RUNNING → STOPPING →   │
//! │  - Supervisor + Pool                      SHUTDOWN               │
//! │  - MessageBus + Listener (unix socket)                           │
//! │  - reaper (SIGCHLD), monitor (heartbeats), plugins               │
//! └──────┬──────────────────────┬───────────────────────┬────────────┘
//!        │ re-exec              │ re-exec               │ frames
//!        ▼                      ▼                       ▼
//!  ┌────────────────┐    ┌────────────────┐     ┌────────────────┐
//!  │ WorkerProcess  │    │ WorkerProcess  │     │  CLI client    │
//!  │ BusClient      │    │ BusClient      │     │  BusClient     │
//!  │ ReloadTrigger  │    │ ReloadTrigger  │     │ StopServer ... │
//!  └────────────────┘    └────────────────┘     └────────────────┘
//! ```
//!
//! ### Worker lifecycle
//! ```text
//! spawn (re-exec, PROCVISOR_WORKER=<id>)
//!   ├─► Batch[ProcessSpawned, ProcessHeartbeat] ── acked ──► on_start(ctx)
//!   ├─► ProcessHeartbeat every heartbeat_interval
//!   ├─► SIGTERM / ctx.stop(code) ─► on_stop   ─► exit(code)
//!   ├─► SIGUSR1 / ctx.reload()   ─► on_reload ─► exit(100)
//!   └─► ctx.detach()             ─► ProcessDetached, no heartbeats, no reloads
//!
//! master on exit: RUNNING ─► respawn after restart_delay
//!                 otherwise ─► pool empty completes stop()
//! ```
//!
//! ## Features
//! | Area              | Description                                                  | Key types / traits                           |
//! |-------------------|--------------------------------------------------------------|----------------------------------------------|
//! | **Server**        | Master state machine, signals, command handlers.             | [`Server`], [`ServerBuilder`], [`Plugin`]    |
//! | **Supervision**   | Spawn to count, respawn, stop with deadline, reload.         | [`Supervisor`], [`Pool`], [`Launcher`]       |
//! | **Workers**       | Callbacks and context of worker processes.                   | [`Worker`], [`WorkerFn`], [`WorkerContext`]  |
//! | **Bus**           | Commands, events and batches over a unix socket.             | [`MessageBus`], [`BusClient`], [`Dispatch`]  |
//! | **Reload**        | Per-worker strategies requesting a graceful replacement.     | [`ReloadStrategy`], [`ReloadTrigger`]        |
//! | **Subscriber API**| Observe process lifecycle events.                            | [`Subscribe`], [`SubscribeFn`]               |
//! | **Errors**        | Typed errors with stable labels.                             | [`RuntimeError`], [`BusError`]               |
//! | **Configuration** | Intervals, timeouts and socket path, loadable from TOML.     | [`ServerConfig`]                             |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust,no_run
//! use std::time::Duration;
//! use procvisor::{OnException, Server, ServerConfig, WorkerContext, WorkerDefinition, WorkerError, WorkerFn};
//!
//! fn main() {
//!     let mut cfg = ServerConfig::default();
//!     cfg.name = "demo".into();
//!
//!     let ticker = WorkerFn::arc(|ctx: WorkerContext| async move {
//!         let token = ctx.cancellation();
//!         while !token.is_cancelled() {
//!             tokio::time::sleep(Duration::from_millis(250)).await;
//!         }
//!         Ok::<_, WorkerError>(())
//!     });
//!
//!     let server = Server::builder(cfg)
//!         .worker(
//!             WorkerDefinition::builder("ticker", ticker)
//!                 .count(2)
//!                 .strategy(OnException::any())
//!                 .build(),
//!         )
//!         .build();
//!
//!     // Same entry point for the master and every re-executed worker.
//!     let code = server.run().unwrap_or(1);
//!     std::process::exit(code);
//! }
//! ```
mod core;
mod error;
mod ipc;
mod reload;
mod runtime;
mod subscribers;
mod workers;

/// Exit code a worker uses to ask for its replacement.
pub const RELOAD_EXIT_CODE: i32 = 100;

// ---- Public re-exports ----

pub use crate::core::{
    drain_exited, report_fatal, Container, ExecLauncher, Launcher, Plugin, PluginRef, Pool,
    ProcessRecord, ProcessSignal, Server, ServerBuilder, ServerConfig, ServerStatus, StatusCell,
    StopHandle, StopOutcome, Supervisor, ENV_SOCKET, ENV_WORKER,
};
pub use error::{BusError, CodecError, RuntimeError, WorkerError};
pub use ipc::{
    BusClient, ClientOptions, Command, CommandFuture, CommandHandler, CommandKind, Dispatch, Event,
    EventKind, Failure, FrameCodec, Listener, Message, MessageBus, Packet, Pid, ProcessInfo, Reply,
    ServerInfo, Subscriptions,
};
pub use reload::{
    Interval, JitterPolicy, MaxRequests, MemoryLimit, OnException, ReloadRequest, ReloadStrategy,
    ReloadTrigger, TriggerEvent,
};
pub use runtime::{peak_rss, Exit, WorkerContext, WorkerProcess};
pub use subscribers::{Subscribe, SubscribeFn};
pub use workers::{Worker, WorkerDefinition, WorkerDefinitionBuilder, WorkerFn, WorkerRef};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
