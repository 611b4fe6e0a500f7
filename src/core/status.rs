//! # Server status shared by the master, the supervisor and plugins.
//!
//! ```text
//! SHUTDOWN ──► STARTING ──► RUNNING ──► STOPPING ──► SHUTDOWN
//!                 └──────────────────────────┘ (fatal startup error)
//! ```
//!
//! [`StatusCell`] is a single-writer cell over a `tokio::sync::watch` channel:
//! every clone observes the same writer-ordered sequence of transitions, and
//! waiters can await a phase instead of polling.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle phase of a server (master or worker process).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    #[default]
    Shutdown,
    Starting,
    Running,
    Stopping,
}

impl ServerStatus {
    /// Upper-case name used in logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Shutdown => "SHUTDOWN",
            ServerStatus::Starting => "STARTING",
            ServerStatus::Running => "RUNNING",
            ServerStatus::Stopping => "STOPPING",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable [`ServerStatus`].
#[derive(Clone, Debug)]
pub struct StatusCell {
    tx: watch::Sender<ServerStatus>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    /// Creates a cell in [`ServerStatus::Shutdown`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ServerStatus::Shutdown);
        Self { tx }
    }

    /// Current phase.
    pub fn get(&self) -> ServerStatus {
        *self.tx.borrow()
    }

    /// True while the server is [`ServerStatus::Running`].
    pub fn is_running(&self) -> bool {
        self.get() == ServerStatus::Running
    }

    /// Moves to `next`; returns the previous phase.
    pub fn set(&self, next: ServerStatus) -> ServerStatus {
        let prev = self.tx.send_replace(next);
        if prev != next {
            tracing::debug!(from = prev.as_str(), to = next.as_str(), "status changed");
        }
        prev
    }

    /// Moves from `from` to `to` only if the current phase is `from`.
    pub fn transition(&self, from: ServerStatus, to: ServerStatus) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|current| {
            if *current == from {
                *current = to;
                changed = true;
            }
            changed
        });
        changed
    }

    /// Subscribes to transitions.
    pub fn watch(&self) -> watch::Receiver<ServerStatus> {
        self.tx.subscribe()
    }

    /// Waits until the phase equals `status`.
    pub async fn wait_for(&self, status: ServerStatus) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| *s == status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_phase() {
        let cell = StatusCell::new();
        let other = cell.clone();
        assert_eq!(other.get(), ServerStatus::Shutdown);

        assert_eq!(cell.set(ServerStatus::Starting), ServerStatus::Shutdown);
        assert_eq!(other.get(), ServerStatus::Starting);
        assert!(!other.is_running());
    }

    #[test]
    fn transition_requires_the_expected_phase() {
        let cell = StatusCell::new();
        assert!(!cell.transition(ServerStatus::Running, ServerStatus::Stopping));
        cell.set(ServerStatus::Running);
        assert!(cell.transition(ServerStatus::Running, ServerStatus::Stopping));
        assert!(!cell.transition(ServerStatus::Running, ServerStatus::Stopping));
        assert_eq!(cell.get(), ServerStatus::Stopping);
    }

    #[tokio::test]
    async fn waiters_see_the_transition() {
        let cell = StatusCell::new();
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(ServerStatus::Running).await })
        };
        cell.set(ServerStatus::Starting);
        cell.set(ServerStatus::Running);
        waiter.await.unwrap();
    }

    #[test]
    fn serializes_as_upper_case() {
        let json = serde_json::to_string(&ServerStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }
}
