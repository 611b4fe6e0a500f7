//! # Event subscribers for the procvisor bus.
//!
//! This module provides the [`Subscribe`] trait and built-in implementations
//! for observing lifecycle events published on the [`MessageBus`](crate::MessageBus).
//!
//! ## Subscriber types
//! - **Passive subscribers** - observe and react to events (logging, metrics, alerts)
//! - **Stateful subscribers** - maintain internal state based on events (the
//!   supervisor's own pool bookkeeping is wired this way)

mod subscribe;

#[cfg(feature = "logging")]
mod log;

pub use subscribe::{Subscribe, SubscribeFn};

#[cfg(feature = "logging")]
pub use log::LogWriter;
