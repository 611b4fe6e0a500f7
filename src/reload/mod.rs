//! Reload strategies and the per-worker trigger.
//!
//! - `strategy`: the [`ReloadStrategy`] trait and built-in strategies;
//! - `trigger`: [`ReloadTrigger`], first-match evaluation and timer tasks;
//! - `jitter`: [`JitterPolicy`], spread of reload thresholds across siblings.

mod jitter;
mod strategy;
mod trigger;

pub use jitter::JitterPolicy;
pub use strategy::{Interval, MaxRequests, MemoryLimit, OnException, ReloadStrategy, TriggerEvent};
pub use trigger::{ReloadRequest, ReloadTrigger};
