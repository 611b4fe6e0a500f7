//! # Worker pool: definitions and live process records of the master.
//!
//! Pure data, no I/O. The pool is the only owner of [`ProcessRecord`]s;
//! everything else reads snapshots.
//!
//! ```text
//! register_worker(def) ──► workers[id]
//! add_child(def, pid)  ──► records[pid]   (spawned by the supervisor)
//!   ProcessSpawned     ──► mark_spawned   (user, wall-clock start, reloadable override)
//!   ProcessHeartbeat   ──► mark_healthy   (heartbeat time, memory)
//!   ProcessDetached    ──► mark_detached
//!   monitor tick       ──► expire_blocked / mark_blocked
//! reaped               ──► mark_deleted(pid)
//! ```
//!
//! ## Rules
//! - A record exists iff the pid is a live, tracked child.
//! - Reads return owned snapshots, so callers may iterate while bus handlers
//!   mutate the pool.
//! - A blocked mark with a persistence window stays set until the window
//!   expires, even if heartbeats resume; without a window a heartbeat clears it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::ipc::{Pid, ProcessInfo};
use crate::workers::WorkerDefinition;

/// One live child process.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessRecord {
    pub pid: Pid,
    /// Id of the owning [`WorkerDefinition`].
    pub worker_id: u32,
    /// Monotonic spawn time.
    pub spawned_at: Instant,
    /// Wall-clock start reported by the process itself.
    pub started_at: Option<SystemTime>,
    /// Effective user reported by the process.
    pub user: Option<String>,
    /// Last heartbeat (spawn time until the first one arrives).
    pub heartbeat: Instant,
    /// Peak resident memory from the last heartbeat, in bytes.
    pub memory: u64,
    /// The process left the managed lifecycle.
    pub detached: bool,
    /// Heartbeat overdue.
    pub blocked: bool,
    /// End of the blocked persistence window.
    pub blocked_until: Option<Instant>,
    /// Instance override of the definition's `reloadable` flag.
    pub reloadable: Option<bool>,
}

impl ProcessRecord {
    fn new(pid: Pid, worker_id: u32, now: Instant) -> Self {
        Self {
            pid,
            worker_id,
            spawned_at: now,
            started_at: None,
            user: None,
            heartbeat: now,
            memory: 0,
            detached: false,
            blocked: false,
            blocked_until: None,
            reloadable: None,
        }
    }

    /// Effective reload eligibility: the instance override, else the definition flag.
    pub fn is_reloadable(&self, def: &WorkerDefinition) -> bool {
        self.reloadable.unwrap_or(def.reloadable())
    }

    /// Status view of this record at `now`.
    pub fn info(&self, def: &WorkerDefinition, now: Instant) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            worker_id: def.id(),
            worker: def.name().to_string(),
            user: self.user.clone(),
            started_at: self.started_at,
            uptime: now.saturating_duration_since(self.spawned_at),
            heartbeat_age: now.saturating_duration_since(self.heartbeat),
            memory: self.memory,
            detached: self.detached,
            blocked: self.blocked,
            reloadable: self.is_reloadable(def),
        }
    }
}

#[derive(Default)]
struct PoolState {
    workers: Vec<Arc<WorkerDefinition>>,
    records: BTreeMap<Pid, ProcessRecord>,
}

impl PoolState {
    fn worker(&self, id: u32) -> Option<&Arc<WorkerDefinition>> {
        self.workers.iter().find(|w| w.id() == id)
    }
}

/// Registry of worker definitions and live process records.
#[derive(Default)]
pub struct Pool {
    state: Mutex<PoolState>,
}

impl Pool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition and assigns its id (1, 2, ... in call order).
    pub fn register_worker(&self, def: WorkerDefinition) -> Arc<WorkerDefinition> {
        let mut state = self.state.lock();
        let id = state.workers.len() as u32 + 1;
        let def = Arc::new(def.with_id(id));
        state.workers.push(Arc::clone(&def));
        def
    }

    /// Registered definitions, in id order.
    pub fn workers(&self) -> Vec<Arc<WorkerDefinition>> {
        self.state.lock().workers.clone()
    }

    /// Definition with the given id.
    pub fn worker(&self, id: u32) -> Option<Arc<WorkerDefinition>> {
        self.state.lock().worker(id).cloned()
    }

    /// Records a freshly spawned child of `def`.
    pub fn add_child(&self, def: &WorkerDefinition, pid: Pid, now: Instant) {
        let previous = self
            .state
            .lock()
            .records
            .insert(pid, ProcessRecord::new(pid, def.id(), now));
        if previous.is_some() {
            tracing::warn!(pid, worker = def.name(), "pid reused before its exit was reaped");
        }
    }

    /// Removes the record of `pid`, returning it with its definition.
    pub fn mark_deleted(&self, pid: Pid) -> Option<(Arc<WorkerDefinition>, ProcessRecord)> {
        let mut state = self.state.lock();
        let record = state.records.remove(&pid)?;
        let def = state.worker(record.worker_id).cloned()?;
        Some((def, record))
    }

    /// Stores what the process reported in its startup handshake.
    pub fn mark_spawned(
        &self,
        pid: Pid,
        user: Option<String>,
        started_at: SystemTime,
        reloadable: Option<bool>,
    ) -> bool {
        self.update(pid, |r| {
            r.user = user;
            r.started_at = Some(started_at);
            r.reloadable = reloadable;
        })
    }

    /// Marks `pid` as detached; it is treated as always fresh from now on.
    pub fn mark_detached(&self, pid: Pid) -> bool {
        self.update(pid, |r| {
            r.detached = true;
            r.blocked = false;
            r.blocked_until = None;
        })
    }

    /// Marks `pid` blocked; `until` is the end of its persistence window.
    ///
    /// Returns true only if the process was not blocked before.
    pub fn mark_blocked(&self, pid: Pid, until: Option<Instant>) -> bool {
        let mut newly = false;
        self.update(pid, |r| {
            if !r.blocked {
                r.blocked = true;
                r.blocked_until = until;
                newly = true;
            }
        });
        newly
    }

    /// Clears blocked marks whose window ended at or before `now`; returns how many.
    pub fn expire_blocked(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let mut cleared = 0;
        for record in state.records.values_mut() {
            if matches!(record.blocked_until, Some(until) if until <= now) {
                record.blocked = false;
                record.blocked_until = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Records a heartbeat received at `time`.
    ///
    /// Clears `blocked` unless its persistence window is still running.
    pub fn mark_healthy(&self, pid: Pid, time: Instant, memory: u64) -> bool {
        self.update(pid, |r| {
            r.heartbeat = time;
            r.memory = memory;
            let window_active = matches!(r.blocked_until, Some(until) if until > time);
            if r.blocked && !window_active {
                r.blocked = false;
                r.blocked_until = None;
            }
        })
    }

    /// Definition owning `pid`.
    pub fn worker_by_pid(&self, pid: Pid) -> Option<Arc<WorkerDefinition>> {
        let state = self.state.lock();
        let record = state.records.get(&pid)?;
        state.worker(record.worker_id).cloned()
    }

    /// Snapshot of the record of `pid`.
    pub fn process(&self, pid: Pid) -> Option<ProcessRecord> {
        self.state.lock().records.get(&pid).cloned()
    }

    /// Live processes of the definition `worker_id`.
    pub fn alive_count(&self, worker_id: u32) -> usize {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| r.worker_id == worker_id)
            .count()
    }

    /// Snapshot of every record with its definition, ordered by pid.
    pub fn all_processes(&self) -> Vec<(Arc<WorkerDefinition>, ProcessRecord)> {
        let state = self.state.lock();
        state
            .records
            .values()
            .filter_map(|r| Some((state.worker(r.worker_id).cloned()?, r.clone())))
            .collect()
    }

    /// Snapshot of live pids.
    pub fn pids(&self) -> Vec<Pid> {
        self.state.lock().records.keys().copied().collect()
    }

    /// Number of live processes.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// True if no process is alive.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    fn update(&self, pid: Pid, f: impl FnOnce(&mut ProcessRecord)) -> bool {
        match self.state.lock().records.get_mut(&pid) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::runtime::WorkerContext;
    use crate::workers::WorkerFn;
    use std::time::Duration;

    fn def(name: &'static str, count: usize) -> WorkerDefinition {
        WorkerDefinition::builder(
            name,
            WorkerFn::arc(|_ctx: WorkerContext| async { Ok::<_, WorkerError>(()) }),
        )
        .count(count)
        .build()
    }

    #[test]
    fn ids_follow_registration_order() {
        let pool = Pool::new();
        let a = pool.register_worker(def("a", 3));
        let b = pool.register_worker(def("b", 1));
        assert_eq!((a.id(), b.id()), (1, 2));
        assert_eq!(pool.worker(2).map(|w| w.name().to_string()), Some("b".into()));
    }

    #[test]
    fn records_track_children_per_definition() {
        let pool = Pool::new();
        let a = pool.register_worker(def("a", 2));
        let b = pool.register_worker(def("b", 1));
        let now = Instant::now();
        pool.add_child(&a, 10, now);
        pool.add_child(&a, 11, now);
        pool.add_child(&b, 12, now);

        assert_eq!(pool.alive_count(a.id()), 2);
        assert_eq!(pool.alive_count(b.id()), 1);
        assert_eq!(pool.worker_by_pid(12).map(|w| w.id()), Some(b.id()));
        assert_eq!(pool.pids(), vec![10, 11, 12]);

        let (owner, record) = pool.mark_deleted(11).unwrap();
        assert_eq!(owner.id(), a.id());
        assert_eq!(record.pid, 11);
        assert!(pool.mark_deleted(11).is_none());
        assert_eq!(pool.alive_count(a.id()), 1);
        assert!(pool.worker_by_pid(11).is_none());
    }

    #[test]
    fn snapshots_survive_concurrent_mutation() {
        let pool = Pool::new();
        let a = pool.register_worker(def("a", 2));
        let now = Instant::now();
        pool.add_child(&a, 1, now);
        pool.add_child(&a, 2, now);

        let snapshot = pool.all_processes();
        for (_, record) in &snapshot {
            pool.mark_deleted(record.pid);
        }
        assert_eq!(snapshot.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn instance_override_wins_over_definition() {
        let pool = Pool::new();
        let a = pool.register_worker(def("a", 1));
        pool.add_child(&a, 7, Instant::now());
        assert!(pool.process(7).unwrap().is_reloadable(&a));

        pool.mark_spawned(7, Some("www".into()), SystemTime::now(), Some(false));
        let record = pool.process(7).unwrap();
        assert!(!record.is_reloadable(&a));
        assert_eq!(record.user.as_deref(), Some("www"));
        assert!(record.started_at.is_some());
    }

    #[test]
    fn blocked_mark_persists_through_heartbeats_until_the_window_ends() {
        let pool = Pool::new();
        let a = pool.register_worker(def("a", 1));
        let t0 = Instant::now();
        pool.add_child(&a, 5, t0);

        let until = t0 + Duration::from_secs(10);
        assert!(pool.mark_blocked(5, Some(until)));
        assert!(!pool.mark_blocked(5, Some(until)));

        pool.mark_healthy(5, t0 + Duration::from_secs(2), 1024);
        let record = pool.process(5).unwrap();
        assert!(record.blocked);
        assert_eq!(record.memory, 1024);

        assert_eq!(pool.expire_blocked(t0 + Duration::from_secs(9)), 0);
        assert_eq!(pool.expire_blocked(until), 1);
        assert!(!pool.process(5).unwrap().blocked);
    }

    #[test]
    fn heartbeat_clears_blocked_without_a_window() {
        let pool = Pool::new();
        let a = pool.register_worker(def("a", 1));
        let t0 = Instant::now();
        pool.add_child(&a, 5, t0);

        pool.mark_blocked(5, None);
        pool.mark_healthy(5, t0 + Duration::from_secs(1), 0);
        assert!(!pool.process(5).unwrap().blocked);
    }

    #[test]
    fn detached_clears_blocked_and_unknown_pids_are_ignored() {
        let pool = Pool::new();
        let a = pool.register_worker(def("a", 1));
        pool.add_child(&a, 5, Instant::now());
        pool.mark_blocked(5, None);

        assert!(pool.mark_detached(5));
        let record = pool.process(5).unwrap();
        assert!(record.detached && !record.blocked);
        assert!(!pool.mark_detached(6));
        assert!(!pool.mark_healthy(6, Instant::now(), 0));
    }
}
