//! # Master process: the top-level state machine.
//!
//! ```text
//! Server::run()
//!   ├─ PROCVISOR_WORKER set ─► WorkerProcess::run (child role)
//!   └─ master role:
//!        SHUTDOWN ─► STARTING
//!          ├─ launcher, signals, bus listener     (failure → report_fatal → SHUTDOWN, Err)
//!          ├─ supervisor + pool subscriptions, command handlers
//!          ├─ reaper (SIGCHLD), liveness monitor
//!          ├─ plugins start, workers spawned      (failure → report_fatal → teardown)
//!        ─► RUNNING
//!          ├─ SIGINT/SIGTERM/SIGHUP/SIGQUIT, StopServer ─► leave loop
//!          ├─ SIGUSR1, ReloadServer                    ─► supervisor.reload()
//!          └─ fatal respawn failure                    ─► report_fatal ─► leave loop
//!        ─► STOPPING ─► supervisor.stop().wait() ─► plugins stop (reverse) ─► socket removed
//!        ─► SHUTDOWN
//! ```
//!
//! ## Rules
//! - Every fatal error goes through [`report_fatal`] before the status changes.
//! - A startup failure leaves nothing running: spawned workers are stopped
//!   and the socket file is removed before `run` returns the error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::builder::ServerBuilder;
use crate::core::config::ServerConfig;
use crate::core::container::Container;
use crate::core::launcher::{ExecLauncher, Launcher, ENV_SOCKET, ENV_WORKER};
use crate::core::plugin::PluginRef;
use crate::core::pool::Pool;
use crate::core::reaper;
use crate::core::signals::{MasterSignal, MasterSignals};
use crate::core::status::{ServerStatus, StatusCell};
use crate::core::supervisor::Supervisor;
use crate::error::{BusError, RuntimeError};
use crate::ipc::{Command, CommandKind, Listener, MessageBus, Reply, ServerInfo};
use crate::runtime::WorkerProcess;
use crate::workers::WorkerDefinition;

/// Logs a fatal error; the single path taken before any fatal state change.
pub fn report_fatal(err: &RuntimeError) {
    tracing::error!(label = err.as_label(), error = %err.as_message(), "fatal error");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Stop,
    Reload,
}

/// A configured server: worker definitions, bus, plugins.
pub struct Server {
    pub(crate) cfg: ServerConfig,
    pub(crate) pool: Arc<Pool>,
    pub(crate) bus: Arc<MessageBus>,
    pub(crate) status: StatusCell,
    pub(crate) container: Arc<Container>,
    pub(crate) plugins: Vec<PluginRef>,
    pub(crate) launcher: Option<Arc<dyn Launcher>>,
}

impl Server {
    /// Starts building a server.
    pub fn builder(cfg: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(cfg)
    }

    /// Configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    /// Master bus (in-process side).
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Shared status.
    pub fn status(&self) -> &StatusCell {
        &self.status
    }

    /// Master key/value store.
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// Registered definitions, in id order.
    pub fn workers(&self) -> Vec<Arc<WorkerDefinition>> {
        self.pool.workers()
    }

    /// Runs the server on a fresh current-thread runtime; returns the exit code.
    ///
    /// Call it from `main` in both roles: a re-executed child takes the
    /// worker role from its environment.
    pub fn run(self) -> Result<i32, RuntimeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| RuntimeError::Runtime { source })?;
        runtime.block_on(self.serve())
    }

    /// Runs the role selected by the environment.
    pub async fn serve(self) -> Result<i32, RuntimeError> {
        match std::env::var(ENV_WORKER) {
            Ok(id) => self.serve_worker(&id).await,
            Err(_) => self.serve_master().await,
        }
    }

    async fn serve_worker(self, id: &str) -> Result<i32, RuntimeError> {
        let id = worker_id(id)?;
        let def = self
            .pool
            .worker(id)
            .ok_or(RuntimeError::UnknownWorker { id })?;
        let socket = std::env::var_os(ENV_SOCKET)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.cfg.socket_path());
        WorkerProcess::new(def, self.cfg).run(&socket).await
    }

    /// Runs the master role until stopped.
    pub async fn serve_master(self) -> Result<i32, RuntimeError> {
        let Server {
            cfg,
            pool,
            bus,
            status,
            container,
            plugins,
            launcher,
        } = self;
        let socket = cfg.socket_path();
        let started_at = SystemTime::now();
        status.set(ServerStatus::Starting);
        tracing::info!(name = %cfg.name, pid = std::process::id(), "master starting");

        let (launcher, mut signals, listener) = match prepare(launcher, &cfg, &bus, &socket) {
            Ok(parts) => parts,
            Err(e) => {
                report_fatal(&e);
                status.set(ServerStatus::Shutdown);
                return Err(e);
            }
        };

        let (supervisor, mut fatal_rx) = Supervisor::new(
            cfg.clone(),
            Arc::clone(&pool),
            status.clone(),
            launcher,
            Arc::clone(&bus),
        );
        supervisor.attach(&bus);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        register_commands(
            &bus,
            &supervisor,
            &container,
            &status,
            control_tx,
            cfg.name.clone(),
            started_at,
        );

        let reaper_token = CancellationToken::new();
        let monitor = supervisor.spawn_monitor();
        let mut started: Vec<PluginRef> = Vec::new();
        let mut fatal = reaper::spawn(Arc::clone(&supervisor), reaper_token.clone()).err();

        if fatal.is_none() {
            for plugin in &plugins {
                match plugin.start(Arc::clone(&bus), status.clone()).await {
                    Ok(()) => started.push(Arc::clone(plugin)),
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }
        if fatal.is_none() {
            fatal = supervisor.start().err();
        }

        let healthy = fatal.is_none();
        if let Some(e) = fatal.as_ref() {
            report_fatal(e);
        }
        if healthy {
            status.set(ServerStatus::Running);
            tracing::info!(workers = pool.workers().len(), processes = pool.len(), "master running");
            fatal = loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        MasterSignal::Stop(name) => {
                            tracing::info!(signal = name, "stop requested");
                            break None;
                        }
                        MasterSignal::Reload => {
                            supervisor.reload();
                        }
                    },
                    Some(control) = control_rx.recv() => match control {
                        Control::Stop => {
                            tracing::info!("stop requested over the bus");
                            break None;
                        }
                        Control::Reload => {
                            supervisor.reload();
                        }
                    },
                    Some(err) = fatal_rx.recv() => {
                        report_fatal(&err);
                        break Some(err);
                    }
                }
            };
        }

        status.set(ServerStatus::Stopping);
        let outcome = supervisor.stop().wait().await;
        tracing::info!(?outcome, "workers stopped");
        for plugin in started.iter().rev() {
            plugin.stop().await;
        }
        supervisor.shutdown();
        reaper_token.cancel();
        let _ = monitor.await;
        listener.shutdown().await;
        status.set(ServerStatus::Shutdown);
        tracing::info!(name = %cfg.name, "master stopped");

        match fatal {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }
}

/// Parses the definition id a child received in its environment.
fn worker_id(raw: &str) -> Result<u32, RuntimeError> {
    raw.trim().parse().map_err(|_| RuntimeError::InvalidWorkerId {
        value: raw.to_string(),
    })
}

/// Fallible startup steps that precede any spawned process.
fn prepare(
    launcher: Option<Arc<dyn Launcher>>,
    cfg: &ServerConfig,
    bus: &Arc<MessageBus>,
    socket: &Path,
) -> Result<(Arc<dyn Launcher>, MasterSignals, Listener), RuntimeError> {
    let launcher: Arc<dyn Launcher> = match launcher {
        Some(launcher) => launcher,
        None => Arc::new(ExecLauncher::current(socket).map_err(|source| RuntimeError::Spawn {
            worker: cfg.name.clone(),
            source,
        })?),
    };
    let signals = MasterSignals::install()?;
    let listener = Listener::bind(Arc::clone(bus), socket, cfg.max_frame_len)?;
    Ok((launcher, signals, listener))
}

fn unexpected(command: Command) -> BusError {
    BusError::handler(format!("unexpected command {}", command.kind().as_str()))
}

/// Installs the master's command handlers on `bus`.
fn register_commands(
    bus: &MessageBus,
    supervisor: &Arc<Supervisor>,
    container: &Arc<Container>,
    status: &StatusCell,
    control: mpsc::UnboundedSender<Control>,
    name: String,
    started_at: SystemTime,
) {
    for (kind, request) in [
        (CommandKind::StopServer, Control::Stop),
        (CommandKind::ReloadServer, Control::Reload),
    ] {
        let control = control.clone();
        bus.handle(kind, move |_cmd| {
            let sent = control.send(request);
            async move {
                sent.map(|_| Reply::Ack)
                    .map_err(|_| BusError::handler("master is shutting down"))
            }
        });
    }

    let store = Arc::clone(container);
    bus.handle(CommandKind::ContainerGet, move |cmd| {
        let result = match cmd {
            Command::ContainerGet { id } => store.get(&id).map(|v| Reply::Value(Some(v))),
            other => Err(unexpected(other)),
        };
        async move { result }
    });

    let store = Arc::clone(container);
    bus.handle(CommandKind::ContainerSet, move |cmd| {
        let result = match cmd {
            Command::ContainerSet { id, value } => {
                store.set(id, value);
                Ok(Reply::Ack)
            }
            other => Err(unexpected(other)),
        };
        async move { result }
    });

    let sup = Arc::clone(supervisor);
    bus.handle(CommandKind::GetSupervisorStatus, move |_cmd| {
        let processes = sup.processes();
        async move { Ok::<_, BusError>(Reply::Supervisor(processes)) }
    });

    let sup = Arc::clone(supervisor);
    let status = status.clone();
    bus.handle(CommandKind::GetServerStatus, move |_cmd| {
        let info = ServerInfo {
            name: name.clone(),
            pid: std::process::id(),
            status: status.get(),
            started_at,
            workers: sup.pool().workers().len(),
            processes: sup.pool().len(),
        };
        async move { Ok::<_, BusError>(Reply::Server(info)) }
    });
}
