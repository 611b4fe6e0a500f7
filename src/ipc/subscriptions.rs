//! # Subscription table: one ordered handler list per [`EventKind`].
//!
//! ## Rules
//! - Insertion order is delivery order.
//! - Delivery iterates over a **snapshot** of the list taken when dispatch
//!   starts: a handler added while an event of the same kind is being
//!   delivered is not invoked for that event, only for later ones.
//! - A panic inside a handler is caught and logged; the remaining handlers
//!   still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ipc::message::{Event, EventKind};
use crate::subscribers::Subscribe;

type HandlerList = Vec<Arc<dyn Subscribe>>;

/// Typed dispatch table of event handlers.
pub struct Subscriptions {
    table: RwLock<[HandlerList; EventKind::COUNT]>,
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriptions {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    /// Appends `sub` to the handlers of `kind`.
    pub fn subscribe(&self, kind: EventKind, sub: Arc<dyn Subscribe>) {
        self.table.write()[kind.index()].push(sub);
    }

    /// Number of handlers registered for `kind`.
    pub fn len(&self, kind: EventKind) -> usize {
        self.table.read()[kind.index()].len()
    }

    /// True if no handler is registered for `kind`.
    pub fn is_empty(&self, kind: EventKind) -> bool {
        self.len(kind) == 0
    }

    /// Delivers `event` to every handler of its kind; returns how many were invoked.
    pub fn emit(&self, event: &Event) -> usize {
        let snapshot: HandlerList = self.table.read()[event.kind().index()].clone();
        for sub in &snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| sub.on_event(event))) {
                tracing::error!(
                    subscriber = sub.name(),
                    event = event.kind().as_str(),
                    panic = ?panic_message(panic.as_ref()),
                    "subscriber panicked"
                );
            }
        }
        snapshot.len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
