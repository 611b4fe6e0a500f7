//! # WorkerContext: what a worker process exposes to its callbacks.
//!
//! ```text
//! ctx.stop(code) ─┐                         ┌─► on_stop(&ctx)   ─► exit(code)
//! ctx.reload()   ─┼─► first call wins ─► mpsc ─► WorkerProcess ─┤
//! SIGTERM/SIGUSR1 ┘   status = STOPPING                         └─► on_reload(&ctx) ─► exit(100)
//!                     cancellation() fires
//!
//! ctx.detach() ─► ProcessDetached (acked) ─► heartbeats/timers stop ─► bus dropped
//! ```
//!
//! ## Rules
//! - `stop` and `reload` are idempotent: only the first request counts.
//! - After `detach`, reload requests are ignored and [`WorkerContext::bus`]
//!   returns `None`; a later terminate signal ends the process with 0.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{ServerStatus, StatusCell, ENV_SOCKET, ENV_WORKER};
use crate::error::BusError;
use crate::ipc::{Dispatch, Event, Message, Pid};
use crate::reload::ReloadTrigger;
use crate::workers::WorkerDefinition;
use crate::RELOAD_EXIT_CODE;

/// Exit requested by a worker process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    /// Graceful stop with the given exit code.
    Stop(i32),
    /// Graceful reload.
    Reload,
}

impl Exit {
    /// Process exit code of this request.
    pub fn code(self) -> i32 {
        match self {
            Exit::Stop(code) => code,
            Exit::Reload => RELOAD_EXIT_CODE,
        }
    }
}

struct Inner {
    pid: Pid,
    definition: Arc<WorkerDefinition>,
    bus: Mutex<Option<Arc<dyn Dispatch>>>,
    trigger: Arc<ReloadTrigger>,
    status: StatusCell,
    cancel: CancellationToken,
    managed: CancellationToken,
    exit: Mutex<Option<Exit>>,
    control: mpsc::UnboundedSender<Exit>,
    detached: AtomicBool,
}

/// Handle given to worker callbacks; cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<Inner>,
}

impl WorkerContext {
    pub(crate) fn new(
        pid: Pid,
        definition: Arc<WorkerDefinition>,
        bus: Arc<dyn Dispatch>,
        trigger: Arc<ReloadTrigger>,
    ) -> (Self, mpsc::UnboundedReceiver<Exit>) {
        let (control, exits) = mpsc::unbounded_channel();
        let ctx = Self {
            inner: Arc::new(Inner {
                pid,
                definition,
                bus: Mutex::new(Some(bus)),
                trigger,
                status: StatusCell::new(),
                cancel: CancellationToken::new(),
                managed: CancellationToken::new(),
                exit: Mutex::new(None),
                control,
                detached: AtomicBool::new(false),
            }),
        };
        (ctx, exits)
    }

    /// Pid of this process.
    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    /// Definition this process runs.
    pub fn definition(&self) -> &Arc<WorkerDefinition> {
        &self.inner.definition
    }

    /// Connection to the master bus; `None` once detached.
    pub fn bus(&self) -> Option<Arc<dyn Dispatch>> {
        self.inner.bus.lock().clone()
    }

    /// Reload trigger of this process.
    pub fn trigger(&self) -> &Arc<ReloadTrigger> {
        &self.inner.trigger
    }

    /// Local lifecycle phase.
    pub fn status(&self) -> ServerStatus {
        self.inner.status.get()
    }

    pub(crate) fn status_cell(&self) -> &StatusCell {
        &self.inner.status
    }

    /// Token cancelled when the process starts stopping or reloading.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Token cancelled when heartbeats and reload timers must stop.
    pub(crate) fn managed(&self) -> &CancellationToken {
        &self.inner.managed
    }

    /// True once the process left the managed lifecycle.
    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    /// Requests a graceful stop ending with `code`.
    ///
    /// Returns false if a stop or reload was already requested.
    pub fn stop(&self, code: i32) -> bool {
        self.request(Exit::Stop(code))
    }

    /// Requests a graceful reload.
    ///
    /// Returns false if already stopping, or if the process is detached.
    pub fn reload(&self) -> bool {
        if self.is_detached() {
            tracing::debug!(pid = self.pid(), "reload ignored by detached worker");
            return false;
        }
        self.request(Exit::Reload)
    }

    fn request(&self, exit: Exit) -> bool {
        {
            let mut slot = self.inner.exit.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(exit);
        }
        self.inner.status.set(ServerStatus::Stopping);
        self.inner.cancel.cancel();
        let _ = self.inner.control.send(exit);
        true
    }

    /// Leaves the managed lifecycle.
    ///
    /// The master acknowledges `ProcessDetached` before heartbeats stop and
    /// the bus is dropped.
    pub async fn detach(&self) -> Result<(), BusError> {
        if self.is_detached() {
            return Ok(());
        }
        let bus = self.bus().ok_or(BusError::Disconnected)?;
        bus.dispatch_batch(vec![Message::Event(Event::ProcessDetached {
            pid: self.pid(),
        })])
        .await?;
        if self.inner.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.managed.cancel();
        self.inner.bus.lock().take();
        tracing::info!(pid = self.pid(), "worker detached from the master");
        Ok(())
    }

    /// Detaches, then replaces the process image with `command`.
    ///
    /// The worker role variables are removed from the new image's
    /// environment. Only returns on failure.
    pub async fn exec(&self, mut command: Command) -> io::Error {
        if let Err(e) = self.detach().await {
            return io::Error::other(e);
        }
        without_role(&mut command).exec()
    }
}

fn without_role(command: &mut Command) -> &mut Command {
    command.env_remove(ENV_WORKER).env_remove(ENV_SOCKET)
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("pid", &self.inner.pid)
            .field("worker", &self.inner.definition.name())
            .field("status", &self.status())
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::ipc::{EventKind, MessageBus};
    use crate::subscribers::SubscribeFn;
    use crate::workers::WorkerFn;

    fn context() -> (WorkerContext, mpsc::UnboundedReceiver<Exit>, Arc<MessageBus>) {
        let def = WorkerDefinition::builder(
            "w",
            WorkerFn::arc(|_ctx: WorkerContext| async { Ok::<_, WorkerError>(()) }),
        )
        .build();
        let bus = Arc::new(MessageBus::new());
        let (trigger, _rx) = ReloadTrigger::new(Vec::new());
        let (ctx, exits) = WorkerContext::new(
            42,
            Arc::new(def),
            Arc::clone(&bus) as Arc<dyn Dispatch>,
            trigger,
        );
        (ctx, exits, bus)
    }

    #[tokio::test]
    async fn first_exit_request_wins() {
        let (ctx, mut exits, _bus) = context();
        let token = ctx.cancellation();

        assert!(ctx.stop(3));
        assert!(!ctx.stop(5));
        assert!(!ctx.reload());

        assert!(token.is_cancelled());
        assert_eq!(ctx.status(), ServerStatus::Stopping);
        assert_eq!(exits.recv().await, Some(Exit::Stop(3)));
        assert!(exits.try_recv().is_err());
    }

    #[test]
    fn reload_exits_with_the_reserved_code() {
        assert_eq!(Exit::Reload.code(), RELOAD_EXIT_CODE);
        assert_eq!(Exit::Stop(7).code(), 7);
    }

    #[test]
    fn exec_image_does_not_inherit_the_worker_role() {
        let mut command = Command::new("/bin/true");
        command.env(ENV_WORKER, "3").env("KEEP", "1");
        let envs: Vec<_> = without_role(&mut command)
            .get_envs()
            .map(|(k, v)| (k.to_os_string(), v.map(|v| v.to_os_string())))
            .collect();

        assert!(envs.contains(&(ENV_WORKER.into(), None)));
        assert!(envs.contains(&(ENV_SOCKET.into(), None)));
        assert!(envs.contains(&("KEEP".into(), Some("1".into()))));
    }

    #[tokio::test]
    async fn detach_announces_itself_and_drops_the_bus() {
        let (ctx, _exits, bus) = context();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            EventKind::ProcessDetached,
            SubscribeFn::arc("detached", move |ev: &Event| sink.lock().push(ev.pid())),
        );

        ctx.detach().await.unwrap();
        ctx.detach().await.unwrap();

        assert_eq!(*seen.lock(), vec![42]);
        assert!(ctx.is_detached());
        assert!(ctx.bus().is_none());
        assert!(ctx.managed().is_cancelled());
        assert!(!ctx.cancellation().is_cancelled());
        assert!(!ctx.reload());
        assert!(ctx.stop(0));
    }
}
