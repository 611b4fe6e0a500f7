//! # Event subscriber trait.
//!
//! Provides [`Subscribe`] an extension point for observing process lifecycle
//! events without coupling to the supervisor internals (status views, metrics
//! aggregators, audit logs).
//!
//! ## Architecture
//! ```text
//! worker ── frame ──► connection ──► MessageBus::publish(&Event)
//! supervisor ─────────────────────►        │
//!                                          ▼
//!                              Subscriptions[event.kind()]   (snapshot)
//!                                 ├──► sub1.on_event()
//!                                 ├──► sub2.on_event()
//!                                 └──► subN.on_event()
//! ```
//!
//! ## Rules
//! - Handlers run on the master's event loop, one after another, in
//!   subscription order; they never run concurrently with supervisor logic.
//! - Handlers must be quick and must not block: spawn a task for slow work.
//! - A panicking handler is isolated and logged; later handlers still run.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use procvisor::{Event, EventKind, MessageBus, Subscribe};
//!
//! struct ExitCounter(std::sync::atomic::AtomicUsize);
//!
//! impl Subscribe for ExitCounter {
//!     fn on_event(&self, ev: &Event) {
//!         if let Event::ProcessExit { .. } = ev {
//!             self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!         }
//!     }
//!     fn name(&self) -> &str { "exit-counter" }
//! }
//!
//! let bus = MessageBus::new();
//! bus.subscribe(EventKind::ProcessExit, Arc::new(ExitCounter(Default::default())));
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use crate::ipc::Event;

/// Observer of bus events.
pub trait Subscribe: Send + Sync + 'static {
    /// Processes a single event.
    ///
    /// Called synchronously from the bus dispatch; keep it short.
    fn on_event(&self, event: &Event);

    /// Returns the subscriber name used in logs.
    ///
    /// The default uses `type_name::<Self>()`, which can be verbose - override it when possible.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Function-backed subscriber.
///
/// ## Example
/// ```rust
/// use procvisor::{Event, EventKind, MessageBus, SubscribeFn};
///
/// let bus = MessageBus::new();
/// bus.subscribe(
///     EventKind::ProcessBlocked,
///     SubscribeFn::arc("pager", |ev: &Event| println!("blocked pid={}", ev.pid())),
/// );
/// ```
pub struct SubscribeFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> SubscribeFn<F>
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    /// Creates a named function subscriber.
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Creates the subscriber and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

impl<F> Subscribe for SubscribeFn<F>
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event) {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
