//! # LogWriter — lifecycle event logger
//!
//! A minimal subscriber that writes incoming [`Event`]s to `tracing`.
//! Use it for demos or as a default audit trail.
//!
//! ## Example output
//! ```text
//! INFO  process spawned pid=4242 worker="http" user=None
//! DEBUG process heartbeat pid=4242 memory=10452992
//! INFO  process detached pid=4243
//! WARN  process blocked pid=4244
//! INFO  process exited pid=4242 exit_code=100
//! ```

use crate::ipc::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Every event kind, for subscribing this writer everywhere at once.
    pub fn kinds() -> &'static [EventKind] {
        &EventKind::ALL
    }
}

impl Subscribe for LogWriter {
    fn on_event(&self, e: &Event) {
        match e {
            Event::ProcessSpawned {
                pid, name, user, ..
            } => {
                tracing::info!(pid, worker = %name, user = ?user, "process spawned");
            }
            Event::ProcessHeartbeat { pid, memory, .. } => {
                tracing::debug!(pid, memory, "process heartbeat");
            }
            Event::ProcessDetached { pid } => {
                tracing::info!(pid, "process detached");
            }
            Event::ProcessBlocked { pid } => {
                tracing::warn!(pid, "process blocked");
            }
            Event::ProcessExit { pid, exit_code } => {
                tracing::info!(pid, exit_code, "process exited");
            }
        }
    }

    fn name(&self) -> &str {
        "LogWriter"
    }
}
