//! # Supervisor: keeps the worker pool at its declared size.
//!
//! The [`Supervisor`] owns no processes directly: records live in the
//! [`Pool`], processes are created and signalled through a [`Launcher`], and
//! exits arrive from the reaper.
//!
//! ## Architecture
//! ```text
//! start() ──► for each definition: spawn until alive_count == count
//!
//! reaper ──► handle_exit(pid, code)
//!              ├─ pool.mark_deleted(pid), publish ProcessExit
//!              ├─ RUNNING  ─► log (info 0/100, warn otherwise) ─► sleep(restart_delay) ─► spawn missing
//!              └─ !RUNNING ─► pool empty? ─► complete stop (Drained)
//!
//! monitor tick ──► expire blocked windows ─► overdue heartbeat? ─► mark blocked, publish ProcessBlocked
//!
//! stop() ──► TERM to every pid ──┬─► drain to empty ─────────► Drained
//!                                └─► stop_timeout elapsed ──► KILL survivors ─► TimedOut
//!                                    (first path completes, the other is cancelled)
//!
//! reload() ──► reloadable ─► USR1 │ reloadable + detached ─► TERM │ others untouched
//! ```
//!
//! ## Rules
//! - No replacement is spawned unless the status is `RUNNING`, both when the
//!   exit is handled and when the restart delay elapses.
//! - `stop()` returns the same [`StopHandle`] on every call; it resolves once.
//! - A failed respawn is fatal: it is reported on the fatal channel and the
//!   master shuts down.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::config::ServerConfig;
use crate::core::launcher::{Launcher, ProcessSignal};
use crate::core::pool::Pool;
use crate::core::status::{ServerStatus, StatusCell};
use crate::error::RuntimeError;
use crate::ipc::{Event, EventKind, MessageBus, Pid, ProcessInfo};
use crate::subscribers::SubscribeFn;
use crate::workers::WorkerDefinition;
use crate::RELOAD_EXIT_CODE;

/// How a stop completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every process exited within the stop timeout.
    Drained,
    /// The deadline passed; `killed` survivors received `SIGKILL`.
    TimedOut {
        /// Number of processes killed.
        killed: usize,
    },
}

/// Awaitable result of [`Supervisor::stop`].
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<Option<StopOutcome>>>,
}

impl StopHandle {
    /// Outcome, if the stop already completed.
    pub fn outcome(&self) -> Option<StopOutcome> {
        *self.tx.borrow()
    }

    /// Waits for the stop to complete.
    pub async fn wait(&self) -> StopOutcome {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => *outcome,
            Err(_) => None,
        };
        outcome.unwrap_or(StopOutcome::Drained)
    }
}

struct StopState {
    handle: StopHandle,
    deadline: CancellationToken,
}

/// Spawns, reaps, monitors, stops and reloads worker processes.
pub struct Supervisor {
    cfg: ServerConfig,
    pool: Arc<Pool>,
    status: StatusCell,
    launcher: Arc<dyn Launcher>,
    bus: Arc<MessageBus>,
    fatal: mpsc::UnboundedSender<RuntimeError>,
    stop: Mutex<Option<StopState>>,
    token: CancellationToken,
}

impl Supervisor {
    /// Creates a supervisor and the receiver of its fatal errors.
    pub fn new(
        cfg: ServerConfig,
        pool: Arc<Pool>,
        status: StatusCell,
        launcher: Arc<dyn Launcher>,
        bus: Arc<MessageBus>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RuntimeError>) {
        let (fatal, fatal_rx) = mpsc::unbounded_channel();
        let sup = Arc::new(Self {
            cfg,
            pool,
            status,
            launcher,
            bus,
            fatal,
            stop: Mutex::new(None),
            token: CancellationToken::new(),
        });
        (sup, fatal_rx)
    }

    /// Shared pool.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Subscribes the pool to worker lifecycle events on `bus`.
    pub fn attach(&self, bus: &MessageBus) {
        let pool = Arc::clone(&self.pool);
        bus.subscribe(
            EventKind::ProcessSpawned,
            SubscribeFn::arc("pool.spawned", move |ev: &Event| {
                if let Event::ProcessSpawned {
                    pid,
                    user,
                    started_at,
                    reloadable,
                    ..
                } = ev
                {
                    if !pool.mark_spawned(*pid, user.clone(), *started_at, *reloadable) {
                        tracing::debug!(pid, "spawn announcement from an untracked process");
                    }
                }
            }),
        );

        let pool = Arc::clone(&self.pool);
        bus.subscribe(
            EventKind::ProcessHeartbeat,
            SubscribeFn::arc("pool.heartbeat", move |ev: &Event| {
                if let Event::ProcessHeartbeat { pid, memory, .. } = ev {
                    pool.mark_healthy(*pid, Instant::now(), *memory);
                }
            }),
        );

        let pool = Arc::clone(&self.pool);
        bus.subscribe(
            EventKind::ProcessDetached,
            SubscribeFn::arc("pool.detached", move |ev: &Event| {
                if pool.mark_detached(ev.pid()) {
                    tracing::info!(pid = ev.pid(), "worker detached");
                }
            }),
        );
    }

    /// Spawns every definition up to its count.
    pub fn start(&self) -> Result<(), RuntimeError> {
        for def in self.pool.workers() {
            self.spawn_missing(&def)?;
        }
        Ok(())
    }

    fn spawn_missing(&self, def: &WorkerDefinition) -> Result<usize, RuntimeError> {
        let mut spawned = 0;
        while self.pool.alive_count(def.id()) < def.count() {
            let pid = self.launcher.spawn(def).map_err(|source| RuntimeError::Spawn {
                worker: def.name().to_string(),
                source,
            })?;
            self.pool.add_child(def, pid, Instant::now());
            tracing::info!(pid, worker = def.name(), "worker spawned");
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Handles one reaped child.
    pub fn handle_exit(self: &Arc<Self>, pid: Pid, code: i32) {
        let Some((def, _record)) = self.pool.mark_deleted(pid) else {
            tracing::debug!(pid, code, "reaped an untracked child");
            return;
        };
        self.bus.emit(&Event::ProcessExit {
            pid,
            exit_code: code,
        });

        if self.status.is_running() {
            match code {
                0 => tracing::info!(pid, worker = def.name(), "worker stopped"),
                RELOAD_EXIT_CODE => tracing::info!(pid, worker = def.name(), "worker reloaded"),
                _ => tracing::warn!(pid, worker = def.name(), code, "worker exited unexpectedly"),
            }
            self.schedule_respawn(def);
        } else {
            tracing::info!(pid, worker = def.name(), code, "worker exited");
            if self.pool.is_empty() {
                self.complete(StopOutcome::Drained);
            }
        }
    }

    fn schedule_respawn(self: &Arc<Self>, def: Arc<WorkerDefinition>) {
        let me = Arc::clone(self);
        let delay = self.cfg.restart_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = me.token.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
            if !me.status.is_running() {
                return;
            }
            if let Err(e) = me.spawn_missing(&def) {
                let _ = me.fatal.send(e);
            }
        });
    }

    /// One liveness scan at `now`.
    pub fn check_liveness(&self, now: Instant) {
        self.pool.expire_blocked(now);
        for (def, record) in self.pool.all_processes() {
            if record.detached || record.blocked {
                continue;
            }
            let elapsed = now.saturating_duration_since(record.heartbeat);
            if elapsed <= self.cfg.blocked_threshold {
                continue;
            }
            let until = self.cfg.blocked_window().map(|window| now + window);
            if self.pool.mark_blocked(record.pid, until) {
                self.bus.emit(&Event::ProcessBlocked { pid: record.pid });
                tracing::warn!(
                    pid = record.pid,
                    worker = def.name(),
                    elapsed_secs = elapsed.as_secs(),
                    "worker blocked: heartbeat overdue"
                );
            }
        }
    }

    /// Starts the periodic liveness scan.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let period = me.cfg.monitor_interval();
            let mut ticks = time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = me.token.cancelled() => break,
                    _ = ticks.tick() => me.check_liveness(Instant::now()),
                }
            }
        })
    }

    /// Gracefully stops every process.
    pub fn stop(self: &Arc<Self>) -> StopHandle {
        let mut guard = self.stop.lock();
        if let Some(state) = guard.as_ref() {
            return state.handle.clone();
        }
        self.status.transition(ServerStatus::Running, ServerStatus::Stopping);

        let (tx, _rx) = watch::channel(None);
        let handle = StopHandle { tx: Arc::new(tx) };
        let deadline = CancellationToken::new();
        *guard = Some(StopState {
            handle: handle.clone(),
            deadline: deadline.clone(),
        });
        drop(guard);

        let pids = self.pool.pids();
        if pids.is_empty() {
            self.complete(StopOutcome::Drained);
            return handle;
        }
        for pid in pids {
            self.send(pid, ProcessSignal::Terminate);
        }

        let me = Arc::clone(self);
        let timeout = self.cfg.stop_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                _ = time::sleep(timeout) => me.kill_survivors(),
            }
        });
        handle
    }

    fn kill_survivors(&self) {
        let survivors = self.pool.all_processes();
        for (def, record) in &survivors {
            self.send(record.pid, ProcessSignal::Kill);
            tracing::warn!(pid = record.pid, worker = def.name(), "worker killed after timeout");
        }
        self.complete(StopOutcome::TimedOut {
            killed: survivors.len(),
        });
    }

    /// Resolves the pending stop; returns false if it was already resolved.
    fn complete(&self, outcome: StopOutcome) -> bool {
        let guard = self.stop.lock();
        let Some(state) = guard.as_ref() else {
            return false;
        };
        let won = state.handle.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
        if won {
            state.deadline.cancel();
            tracing::info!(?outcome, "supervisor stopped");
        }
        won
    }

    /// Asks every reloadable process to reload.
    pub fn reload(&self) -> usize {
        let mut signalled = 0;
        for (def, record) in self.pool.all_processes() {
            if !record.is_reloadable(&def) {
                continue;
            }
            let signal = if record.detached {
                ProcessSignal::Terminate
            } else {
                ProcessSignal::Reload
            };
            self.send(record.pid, signal);
            signalled += 1;
        }
        tracing::info!(signalled, "reload requested");
        signalled
    }

    /// Status rows for every live process.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        let now = Instant::now();
        self.pool
            .all_processes()
            .iter()
            .map(|(def, record)| record.info(def, now))
            .collect()
    }

    /// Cancels the monitor and pending respawn timers.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    fn send(&self, pid: Pid, signal: ProcessSignal) {
        if let Err(e) = self.launcher.signal(pid, signal) {
            tracing::warn!(pid, ?signal, error = %e, "failed to signal worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::launcher::testing::FakeLauncher;
    use crate::error::WorkerError;
    use crate::runtime::WorkerContext;
    use crate::workers::WorkerFn;
    use std::collections::BTreeSet;
    use std::time::{Duration, SystemTime};

    struct Harness {
        sup: Arc<Supervisor>,
        launcher: Arc<FakeLauncher>,
        bus: Arc<MessageBus>,
        status: StatusCell,
        fatal: mpsc::UnboundedReceiver<RuntimeError>,
    }

    fn def(name: &'static str, count: usize, reloadable: bool) -> WorkerDefinition {
        WorkerDefinition::builder(
            name,
            WorkerFn::arc(|_ctx: WorkerContext| async { Ok::<_, WorkerError>(()) }),
        )
        .count(count)
        .reloadable(reloadable)
        .build()
    }

    fn harness(defs: Vec<WorkerDefinition>) -> Harness {
        let mut cfg = ServerConfig::default();
        cfg.restart_delay = Duration::from_secs(1);
        cfg.stop_timeout = Duration::from_secs(5);
        cfg.blocked_threshold = Duration::from_secs(5);
        cfg.blocked_persistence = Duration::from_secs(10);

        let pool = Arc::new(Pool::new());
        for d in defs {
            pool.register_worker(d);
        }
        let launcher = Arc::new(FakeLauncher::new());
        let bus = Arc::new(MessageBus::new());
        let status = StatusCell::new();
        let (sup, fatal) = Supervisor::new(
            cfg,
            pool,
            status.clone(),
            Arc::clone(&launcher) as Arc<dyn Launcher>,
            Arc::clone(&bus),
        );
        sup.attach(&bus);
        Harness {
            sup,
            launcher,
            bus,
            status,
            fatal,
        }
    }

    fn running(defs: Vec<WorkerDefinition>) -> Harness {
        let h = harness(defs);
        h.sup.start().unwrap();
        h.status.set(ServerStatus::Running);
        h
    }

    fn pids_of(h: &Harness, worker_id: u32) -> BTreeSet<Pid> {
        h.sup
            .pool()
            .all_processes()
            .into_iter()
            .filter(|(d, _)| d.id() == worker_id)
            .map(|(_, r)| r.pid)
            .collect()
    }

    fn count_events(bus: &MessageBus, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            kind,
            SubscribeFn::arc("test", move |ev: &Event| sink.lock().push(ev.clone())),
        );
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn start_fills_every_definition_and_respawns_a_killed_pid() {
        let h = running(vec![def("a", 3, true), def("b", 1, true)]);
        assert_eq!(h.sup.pool().len(), 4);
        assert_eq!(h.sup.pool().alive_count(1), 3);
        assert_eq!(h.sup.pool().alive_count(2), 1);

        let before = pids_of(&h, 1);
        let victim = *before.iter().next().unwrap();
        h.sup.handle_exit(victim, 137);
        assert_eq!(h.sup.pool().alive_count(1), 2);

        time::sleep(Duration::from_millis(1001)).await;
        let after = pids_of(&h, 1);
        assert_eq!(after.len(), 3);
        assert!(!after.contains(&victim));
        assert_ne!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_publishes_process_exit() {
        let h = running(vec![def("a", 1, true)]);
        let exits = count_events(&h.bus, EventKind::ProcessExit);
        let pid = h.sup.pool().pids()[0];

        h.sup.handle_exit(pid, RELOAD_EXIT_CODE);
        assert_eq!(
            *exits.lock(),
            vec![Event::ProcessExit {
                pid,
                exit_code: RELOAD_EXIT_CODE
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_respawn_once_status_leaves_running() {
        let h = running(vec![def("a", 2, true)]);
        let pid = h.sup.pool().pids()[0];

        h.sup.handle_exit(pid, 1);
        h.status.set(ServerStatus::Stopping);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.sup.pool().alive_count(1), 1);

        let other = h.sup.pool().pids()[0];
        h.sup.handle_exit(other, 1);
        time::sleep(Duration::from_secs(5)).await;
        assert!(h.sup.pool().is_empty());
        assert_eq!(h.launcher.spawned.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_respawn_is_reported_as_fatal() {
        let mut h = running(vec![def("a", 1, true)]);
        let pid = h.sup.pool().pids()[0];
        *h.launcher.fail.lock() = true;

        h.sup.handle_exit(pid, 2);
        let err = h.fatal.recv().await.unwrap();
        assert_eq!(err.as_label(), "runtime_spawn_failed");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_and_resolves_once() {
        let h = running(vec![def("a", 2, true)]);
        let pids = h.sup.pool().pids();

        let first = h.sup.stop();
        let second = h.sup.stop();
        assert_eq!(h.status.get(), ServerStatus::Stopping);
        for pid in &pids {
            assert_eq!(h.launcher.signals_for(*pid), vec![ProcessSignal::Terminate]);
        }

        h.sup.handle_exit(pids[0], 0);
        assert_eq!(first.outcome(), None);
        h.sup.handle_exit(pids[1], 0);
        assert_eq!(first.wait().await, StopOutcome::Drained);
        assert_eq!(second.wait().await, StopOutcome::Drained);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(first.outcome(), Some(StopOutcome::Drained));
        assert!(h
            .launcher
            .signals
            .lock()
            .iter()
            .all(|(_, s)| *s != ProcessSignal::Kill));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_deadline_kills_survivors_and_ignores_late_drain() {
        let h = running(vec![def("a", 2, true)]);
        let pids = h.sup.pool().pids();

        let handle = h.sup.stop();
        h.sup.handle_exit(pids[0], 0);

        assert_eq!(handle.wait().await, StopOutcome::TimedOut { killed: 1 });
        assert_eq!(
            h.launcher.signals_for(pids[1]),
            vec![ProcessSignal::Terminate, ProcessSignal::Kill]
        );

        h.sup.handle_exit(pids[1], 137);
        assert_eq!(handle.outcome(), Some(StopOutcome::TimedOut { killed: 1 }));
    }

    #[tokio::test]
    async fn stop_with_empty_pool_completes_immediately() {
        let h = running(vec![def("a", 0, true)]);
        assert_eq!(h.sup.stop().outcome(), Some(StopOutcome::Drained));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_is_selective() {
        let h = running(vec![def("a", 1, true), def("b", 1, true), def("c", 1, false)]);
        let a = *pids_of(&h, 1).iter().next().unwrap();
        let b = *pids_of(&h, 2).iter().next().unwrap();
        let c = *pids_of(&h, 3).iter().next().unwrap();
        h.bus.emit(&Event::ProcessDetached { pid: b });

        assert_eq!(h.sup.reload(), 2);
        assert_eq!(h.launcher.signals_for(a), vec![ProcessSignal::Reload]);
        assert_eq!(h.launcher.signals_for(b), vec![ProcessSignal::Terminate]);
        assert!(h.launcher.signals_for(c).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reloadable_override_comes_from_the_spawn_announcement() {
        let h = running(vec![def("a", 1, true)]);
        let pid = h.sup.pool().pids()[0];
        h.bus.emit(&Event::ProcessSpawned {
            pid,
            user: None,
            name: "a".into(),
            started_at: SystemTime::now(),
            reloadable: Some(false),
        });

        assert_eq!(h.sup.reload(), 0);
        assert!(!h.sup.processes()[0].reloadable);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_is_reported_once_and_heartbeat_does_not_unblock_within_the_window() {
        let h = running(vec![def("a", 1, true)]);
        let blocked = count_events(&h.bus, EventKind::ProcessBlocked);
        let pid = h.sup.pool().pids()[0];
        let heartbeat = || Event::ProcessHeartbeat {
            pid,
            memory: 0,
            time: SystemTime::now(),
        };

        time::advance(Duration::from_secs(6)).await;
        h.sup.check_liveness(Instant::now());
        h.sup.check_liveness(Instant::now());
        assert_eq!(blocked.lock().len(), 1);
        assert!(h.sup.processes()[0].blocked);

        time::advance(Duration::from_secs(1)).await;
        h.bus.emit(&heartbeat());
        h.sup.check_liveness(Instant::now());
        assert!(h.sup.processes()[0].blocked);
        assert_eq!(blocked.lock().len(), 1);

        time::advance(Duration::from_secs(10)).await;
        h.bus.emit(&heartbeat());
        h.sup.check_liveness(Instant::now());
        assert!(!h.sup.processes()[0].blocked);
        assert_eq!(blocked.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_processes_are_always_fresh() {
        let h = running(vec![def("a", 1, true)]);
        let blocked = count_events(&h.bus, EventKind::ProcessBlocked);
        let pid = h.sup.pool().pids()[0];
        h.bus.emit(&Event::ProcessDetached { pid });

        time::advance(Duration::from_secs(60)).await;
        h.sup.check_liveness(Instant::now());
        assert!(blocked.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_task_runs_the_scan() {
        let h = running(vec![def("a", 1, true)]);
        let blocked = count_events(&h.bus, EventKind::ProcessBlocked);
        let monitor = h.sup.spawn_monitor();

        time::sleep(Duration::from_millis(6500)).await;
        assert_eq!(blocked.lock().len(), 1);

        h.sup.shutdown();
        monitor.await.unwrap();
    }
}
