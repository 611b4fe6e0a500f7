//! # WorkerProcess: the runtime of one supervised child.
//!
//! ```text
//! run(socket)
//!   ├─ WorkerSignals::install      (TERM → stop, USR1 → reload, INT/HUP swallowed)
//!   ├─ BusClient::connect(socket)
//!   ├─ groups, gid, uid            (failure → warning)
//!   └─ serve
//!        ├─ dispatch_batch[ProcessSpawned, ProcessHeartbeat] ── awaits ack
//!        ├─ heartbeat task every heartbeat_interval (peak RSS, fed to the trigger)
//!        ├─ reload timers
//!        ├─ on_start(ctx)          (errors and panics → log + TriggerEvent::Exception)
//!        └─ loop: exit request │ signal │ trigger request
//!               └─ on_stop / on_reload ─► exit code
//! ```
//!
//! The child is a fresh image of the executable (see
//! [`ExecLauncher`](crate::ExecLauncher)), so nothing of the master's runtime
//! is inherited; everything above is created here.

#[cfg(not(target_vendor = "apple"))]
use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

#[cfg(not(target_vendor = "apple"))]
use nix::errno::Errno;
use nix::sys::resource::{getrusage, UsageWho};
#[cfg(not(target_vendor = "apple"))]
use nix::unistd::{initgroups, setgroups};
use nix::unistd::{setgid, setuid, Gid, Group, User};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::core::signals::{WorkerSignal, WorkerSignals};
use crate::core::{ServerConfig, ServerStatus};
use crate::error::RuntimeError;
use crate::ipc::{BusClient, ClientOptions, Dispatch, Event, Message, Pid};
use crate::reload::{ReloadTrigger, TriggerEvent};
use crate::runtime::context::{Exit, WorkerContext};
use crate::workers::WorkerDefinition;

/// Peak resident set size of this process, in bytes.
pub fn peak_rss() -> u64 {
    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max = usage.max_rss().max(0) as u64;
            // Linux reports kilobytes, macOS bytes.
            if cfg!(target_os = "macos") {
                max
            } else {
                max * 1024
            }
        }
        Err(_) => 0,
    }
}

fn heartbeat(pid: Pid, memory: u64) -> Event {
    Event::ProcessHeartbeat {
        pid,
        memory,
        time: SystemTime::now(),
    }
}

/// Target identity of a worker, resolved from its definition.
#[derive(Debug, Default)]
struct Identity {
    user: Option<User>,
    gid: Option<Gid>,
}

/// Looks up the configured user and group; the gid defaults to the user's
/// primary group.
fn resolve_identity(def: &WorkerDefinition) -> Identity {
    let user = def.user().and_then(|name| match User::from_name(name) {
        Ok(Some(user)) => Some(user),
        Ok(None) => {
            tracing::warn!(user = name, "unknown user");
            None
        }
        Err(e) => {
            tracing::warn!(user = name, error = %e, "user lookup failed");
            None
        }
    });
    let group = def.group().and_then(|name| match Group::from_name(name) {
        Ok(Some(group)) => Some(group.gid),
        Ok(None) => {
            tracing::warn!(group = name, "unknown group");
            None
        }
        Err(e) => {
            tracing::warn!(group = name, error = %e, "group lookup failed");
            None
        }
    });
    let gid = group.or_else(|| user.as_ref().map(|u| u.gid));
    Identity { user, gid }
}

#[cfg(not(target_vendor = "apple"))]
fn reset_groups(user: Option<&User>, gid: Gid) -> nix::Result<()> {
    match user {
        Some(user) => {
            let name = CString::new(user.name.as_str()).map_err(|_| Errno::EINVAL)?;
            initgroups(&name, gid)
        }
        None => setgroups(&[gid]),
    }
}

#[cfg(target_vendor = "apple")]
fn reset_groups(_user: Option<&User>, _gid: Gid) -> nix::Result<()> {
    Ok(())
}

/// Drops to the configured identity: supplementary groups, then gid, then uid.
///
/// Every failure is a warning; returns the user actually in effect.
fn apply_identity(def: &WorkerDefinition) -> Option<String> {
    let Identity { user, gid } = resolve_identity(def);
    if let Some(gid) = gid {
        if let Err(e) = reset_groups(user.as_ref(), gid) {
            tracing::warn!(%gid, error = %e, "failed to reset supplementary groups");
        }
        if let Err(e) = setgid(gid) {
            tracing::warn!(%gid, error = %e, "failed to switch group");
        }
    }

    let user = user?;
    match setuid(user.uid) {
        Ok(()) => Some(user.name),
        Err(e) => {
            tracing::warn!(user = %user.name, error = %e, "failed to switch user");
            None
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(s) => *s,
        Err(panic) => match panic.downcast::<&str>() {
            Ok(s) => s.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

/// Runtime of one worker process.
pub struct WorkerProcess {
    def: Arc<WorkerDefinition>,
    cfg: ServerConfig,
}

impl WorkerProcess {
    /// Runtime for `def`.
    pub fn new(def: Arc<WorkerDefinition>, cfg: ServerConfig) -> Self {
        Self { def, cfg }
    }

    /// Runs the worker until it stops; returns its exit code.
    pub async fn run(self, socket: &Path) -> Result<i32, RuntimeError> {
        let mut signals = WorkerSignals::install()?;
        let (client, user) = self.join(socket).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let signal = signals.recv().await;
                if tx.send(signal).is_err() {
                    break;
                }
            }
        });
        self.serve(Arc::new(client), user, rx).await
    }

    /// Connects to the master bus, then drops to the configured identity.
    ///
    /// The socket is only writable by the master's user, so the connection
    /// must exist before the switch.
    async fn join(&self, socket: &Path) -> Result<(BusClient, Option<String>), RuntimeError> {
        let options = ClientOptions {
            max_frame_len: self.cfg.max_frame_len,
            timeout: None,
        };
        let client = BusClient::connect_with(socket, options).await?;
        let user = apply_identity(&self.def);
        Ok((client, user))
    }

    pub(crate) async fn serve(
        self,
        bus: Arc<dyn Dispatch>,
        user: Option<String>,
        mut signals: mpsc::UnboundedReceiver<WorkerSignal>,
    ) -> Result<i32, RuntimeError> {
        let pid = std::process::id();
        let (trigger, mut reloads) = ReloadTrigger::new(self.def.strategies().to_vec());
        let (ctx, mut exits) =
            WorkerContext::new(pid, Arc::clone(&self.def), Arc::clone(&bus), Arc::clone(&trigger));
        ctx.status_cell().set(ServerStatus::Starting);

        bus.dispatch_batch(vec![
            Message::Event(Event::ProcessSpawned {
                pid,
                user,
                name: self.def.name().to_string(),
                started_at: SystemTime::now(),
                reloadable: self.def.worker().reloadable(),
            }),
            Message::Event(heartbeat(pid, peak_rss())),
        ])
        .await?;
        ctx.status_cell().set(ServerStatus::Running);
        tracing::info!(pid, worker = self.def.name(), "worker started");

        self.spawn_heartbeats(&ctx, bus);
        trigger.start_timers(ctx.managed());
        self.spawn_on_start(&ctx);

        loop {
            tokio::select! {
                Some(exit) = exits.recv() => return Ok(self.finish(&ctx, exit).await),
                Some(signal) = signals.recv() => match signal {
                    WorkerSignal::Stop if ctx.is_detached() => {
                        tracing::info!(pid, "detached worker terminated");
                        return Ok(0);
                    }
                    WorkerSignal::Stop => {
                        ctx.stop(0);
                    }
                    WorkerSignal::Reload => {
                        ctx.reload();
                    }
                },
                Some(request) = reloads.recv() => {
                    tracing::info!(pid, strategy = request.strategy, "reload strategy matched");
                    ctx.reload();
                }
                else => return Ok(0),
            }
        }
    }

    fn spawn_heartbeats(&self, ctx: &WorkerContext, bus: Arc<dyn Dispatch>) {
        let period = self.cfg.heartbeat_interval();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let managed = ctx.managed().clone();
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = managed.cancelled() => break,
                    _ = ticks.tick() => {
                        let memory = peak_rss();
                        if let Err(e) = bus.publish(heartbeat(ctx.pid(), memory)) {
                            tracing::warn!(error = %e, "lost the master bus, stopping");
                            ctx.stop(0);
                            break;
                        }
                        ctx.trigger().emit(&TriggerEvent::Memory { bytes: memory });
                    }
                }
            }
        });
    }

    fn spawn_on_start(&self, ctx: &WorkerContext) {
        let worker = Arc::clone(self.def.worker());
        let start_ctx = ctx.clone();
        let trigger = Arc::clone(ctx.trigger());
        let name = self.def.name().to_string();
        tokio::spawn(async move {
            let run = tokio::spawn(async move { worker.on_start(start_ctx).await });
            let message = match run.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) if e.is_panic() => panic_message(e.into_panic()),
                Err(_) => return,
            };
            tracing::error!(worker = %name, error = %message, "on_start failed");
            trigger.emit(&TriggerEvent::Exception { message });
        });
    }

    async fn finish(&self, ctx: &WorkerContext, exit: Exit) -> i32 {
        ctx.managed().cancel();
        let worker = self.def.worker();
        let (hook, result) = match exit {
            Exit::Stop(_) => ("on_stop", worker.on_stop(ctx).await),
            Exit::Reload => ("on_reload", worker.on_reload(ctx).await),
        };
        if let Err(e) = result {
            tracing::error!(worker = self.def.name(), hook, error = %e, "worker callback failed");
        }
        let code = exit.code();
        tracing::info!(pid = ctx.pid(), worker = self.def.name(), code, "worker exiting");
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::ipc::{EventKind, MessageBus};
    use crate::reload::OnException;
    use crate::subscribers::SubscribeFn;
    use crate::workers::Worker;
    use crate::RELOAD_EXIT_CODE;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum OnStart {
        Idle,
        StopWith(i32),
        Fail,
        Panic,
        Detach,
    }

    struct Recorder {
        log: Log,
        on_start: OnStart,
    }

    #[async_trait]
    impl Worker for Recorder {
        async fn on_start(&self, ctx: WorkerContext) -> Result<(), WorkerError> {
            self.log.lock().push("start".into());
            match self.on_start {
                OnStart::Idle => Ok(()),
                OnStart::StopWith(code) => {
                    ctx.stop(code);
                    Ok(())
                }
                OnStart::Fail => Err(WorkerError::fail("database unreachable")),
                OnStart::Panic => panic!("worker exploded"),
                OnStart::Detach => {
                    ctx.detach().await.map_err(WorkerError::fail)?;
                    self.log.lock().push("detached".into());
                    Ok(())
                }
            }
        }

        async fn on_stop(&self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
            self.log.lock().push("stop".into());
            Ok(())
        }

        async fn on_reload(&self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
            self.log.lock().push("reload".into());
            Ok(())
        }
    }

    struct Setup {
        process: WorkerProcess,
        bus: Arc<MessageBus>,
        log: Log,
        signals: mpsc::UnboundedSender<WorkerSignal>,
        rx: mpsc::UnboundedReceiver<WorkerSignal>,
    }

    fn setup(on_start: OnStart, on_exception: bool) -> Setup {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = WorkerDefinition::builder(
            "recorder",
            Arc::new(Recorder {
                log: Arc::clone(&log),
                on_start,
            }),
        );
        if on_exception {
            builder = builder.strategy(OnException::any());
        }
        let mut cfg = ServerConfig::default();
        cfg.heartbeat_interval = Duration::from_secs(1);

        let bus = Arc::new(MessageBus::new());
        for kind in EventKind::ALL {
            let log = Arc::clone(&log);
            bus.subscribe(
                kind,
                SubscribeFn::arc("recorder", move |ev: &Event| {
                    log.lock().push(ev.kind().as_str().to_string())
                }),
            );
        }
        let (signals, rx) = mpsc::unbounded_channel();
        Setup {
            process: WorkerProcess::new(Arc::new(builder.build()), cfg),
            bus,
            log,
            signals,
            rx,
        }
    }

    impl Setup {
        async fn serve(self) -> (i32, Vec<String>) {
            let code = self
                .process
                .serve(self.bus as Arc<dyn Dispatch>, None, self.rx)
                .await
                .unwrap();
            let log = self.log.lock().clone();
            (code, log)
        }
    }

    #[tokio::test]
    async fn handshake_is_acknowledged_before_on_start() {
        let s = setup(OnStart::StopWith(0), false);
        let (code, log) = s.serve().await;

        assert_eq!(code, 0);
        assert_eq!(log, ["ProcessSpawned", "ProcessHeartbeat", "start", "stop"]);
    }

    #[tokio::test]
    async fn stop_code_is_the_exit_code() {
        let (code, _log) = setup(OnStart::StopWith(3), false).serve().await;
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn terminate_signal_stops_gracefully() {
        let s = setup(OnStart::Idle, false);
        s.signals.send(WorkerSignal::Stop).unwrap();
        let (code, log) = s.serve().await;

        assert_eq!(code, 0);
        assert_eq!(log.last().map(String::as_str), Some("stop"));
    }

    #[tokio::test]
    async fn reload_signal_exits_with_the_reload_code() {
        let s = setup(OnStart::Idle, false);
        s.signals.send(WorkerSignal::Reload).unwrap();
        let (code, log) = s.serve().await;

        assert_eq!(code, RELOAD_EXIT_CODE);
        assert_eq!(log.last().map(String::as_str), Some("reload"));
    }

    #[tokio::test]
    async fn failing_on_start_feeds_the_trigger() {
        let (code, log) = setup(OnStart::Fail, true).serve().await;
        assert_eq!(code, RELOAD_EXIT_CODE);
        assert_eq!(log.last().map(String::as_str), Some("reload"));
    }

    #[tokio::test]
    async fn panicking_on_start_is_isolated() {
        let (code, log) = setup(OnStart::Panic, true).serve().await;
        assert_eq!(code, RELOAD_EXIT_CODE);
        assert!(log.contains(&"start".to_string()));
    }

    #[tokio::test]
    async fn detached_worker_ignores_reload_and_terminates_with_zero() {
        let s = setup(OnStart::Detach, false);
        let signals = s.signals.clone();
        let log = Arc::clone(&s.log);
        let run = tokio::spawn(s.serve());

        while !log.lock().contains(&"detached".to_string()) {
            tokio::task::yield_now().await;
        }
        signals.send(WorkerSignal::Reload).unwrap();
        signals.send(WorkerSignal::Stop).unwrap();
        let (code, log) = run.await.unwrap();

        assert_eq!(code, 0);
        assert!(log.contains(&"ProcessDetached".to_string()));
        assert!(!log.contains(&"stop".to_string()));
        assert!(!log.contains(&"reload".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_follow_the_interval() {
        let s = setup(OnStart::Idle, false);
        let signals = s.signals.clone();
        let log = Arc::clone(&s.log);
        let run = tokio::spawn(s.serve());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        signals.send(WorkerSignal::Stop).unwrap();
        run.await.unwrap();

        let beats = log
            .lock()
            .iter()
            .filter(|e| e.as_str() == "ProcessHeartbeat")
            .count();
        assert_eq!(beats, 4);
    }

    fn with_identity(user: Option<&str>, group: Option<&str>) -> WorkerProcess {
        let mut builder = WorkerDefinition::builder(
            "identity",
            crate::workers::WorkerFn::arc(|_ctx: WorkerContext| async { Ok::<_, WorkerError>(()) }),
        );
        if let Some(user) = user {
            builder = builder.user(user);
        }
        if let Some(group) = group {
            builder = builder.group(group);
        }
        WorkerProcess::new(Arc::new(builder.build()), ServerConfig::default())
    }

    #[test]
    fn group_defaults_to_the_primary_group_of_the_user() {
        let process = with_identity(Some("root"), None);
        let identity = resolve_identity(&process.def);

        assert_eq!(identity.user.map(|u| u.name), Some("root".to_string()));
        assert_eq!(identity.gid, Some(Gid::from_raw(0)));
    }

    #[test]
    fn unknown_names_leave_the_identity_alone() {
        let process = with_identity(Some("procvisor-no-such-user"), Some("procvisor-no-such-group"));
        let identity = resolve_identity(&process.def);

        assert!(identity.user.is_none());
        assert!(identity.gid.is_none());
        assert_eq!(apply_identity(&process.def), None);
    }

    /// Joins in a fresh runtime and reports the identity in effect afterwards.
    #[cfg(target_os = "linux")]
    fn join_and_describe(process: &WorkerProcess, socket: &Path) -> String {
        use nix::unistd::{getgid, getgroups, getuid};

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => return format!("runtime: {e}"),
        };
        match runtime.block_on(process.join(socket)) {
            Ok((_client, user)) => {
                let groups = getgroups().unwrap_or_default();
                format!(
                    "user={} uid={} gid={} root_group={}",
                    user.unwrap_or_default(),
                    getuid(),
                    getgid(),
                    groups.contains(&Gid::from_raw(0)),
                )
            }
            Err(e) => format!("join failed: {e}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial_test::serial(children)]
    fn unprivileged_worker_still_joins_the_bus() {
        use crate::ipc::Listener;
        use nix::sys::wait::waitpid;
        use nix::unistd::{fork, geteuid, ForkResult};

        if !geteuid().is_root() {
            return;
        }
        let Ok(Some(nobody)) = User::from_name("nobody") else {
            return;
        };

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("bus.sock");
        let report = dir.path().join("report");
        let process = with_identity(Some("nobody"), None);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let listener = {
            let _guard = runtime.enter();
            Listener::bind(Arc::new(MessageBus::new()), &socket, 1 << 20).unwrap()
        };

        // SAFETY: the child only builds its own runtime, writes a file and exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let outcome = join_and_describe(&process, &socket);
                let _ = std::fs::write(&report, outcome);
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                let _ = waitpid(child, None);
            }
        }

        let outcome = std::fs::read_to_string(&report).unwrap();
        assert_eq!(
            outcome,
            format!(
                "user=nobody uid={} gid={} root_group=false",
                nobody.uid, nobody.gid
            )
        );
        runtime.block_on(listener.shutdown());
    }
}
