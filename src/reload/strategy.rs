//! # Reload strategies.
//!
//! A [`ReloadStrategy`] looks at one [`TriggerEvent`] and answers whether the
//! current worker process should be replaced. Built-in strategies:
//!
//! | Strategy          | Event            | Reloads when                                  |
//! |-------------------|------------------|-----------------------------------------------|
//! | [`OnException`]   | `Exception`      | any exception, or one whose message matches   |
//! | [`MaxRequests`]   | `Request`        | the process served its (jittered) request cap |
//! | [`MemoryLimit`]   | `Memory`         | peak resident memory exceeds the limit        |
//! | [`Interval`]      | `Tick` (timer)   | the (jittered) lifetime elapsed               |
//!
//! Timer strategies report [`ReloadStrategy::interval`]; the trigger runs them
//! as periodic callbacks instead of evaluating them on ad-hoc events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::reload::jitter::JitterPolicy;

/// Observation fed to the reload trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerEvent {
    /// An error escaped a worker callback.
    Exception {
        /// Error message.
        message: String,
    },
    /// The worker finished serving one request.
    Request,
    /// Current peak resident memory.
    Memory {
        /// Bytes.
        bytes: u64,
    },
    /// Periodic timer tick (timer strategies only).
    Tick,
}

impl TriggerEvent {
    /// Builds an exception event from anything printable.
    pub fn exception(err: impl ToString) -> Self {
        TriggerEvent::Exception {
            message: err.to_string(),
        }
    }
}

/// Decides whether the current worker process should reload.
pub trait ReloadStrategy: Send + Sync + 'static {
    /// Returns true if `event` calls for a reload.
    fn should_reload(&self, event: &TriggerEvent) -> bool;

    /// Period of a timer strategy; `None` for event-driven strategies.
    fn interval(&self) -> Option<Duration> {
        None
    }

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Reloads on exceptions, optionally only those whose message contains a pattern.
#[derive(Clone, Debug, Default)]
pub struct OnException {
    pattern: Option<String>,
}

impl OnException {
    /// Reloads on any exception.
    pub fn any() -> Self {
        Self { pattern: None }
    }

    /// Reloads on exceptions whose message contains `pattern`.
    pub fn matching(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
        }
    }
}

impl ReloadStrategy for OnException {
    fn should_reload(&self, event: &TriggerEvent) -> bool {
        match (event, &self.pattern) {
            (TriggerEvent::Exception { .. }, None) => true,
            (TriggerEvent::Exception { message }, Some(pattern)) => message.contains(pattern),
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        "on_exception"
    }
}

/// Reloads after a number of served requests.
///
/// The limit is drawn once per process from the configured jitter, so
/// siblings started together reach it at different times.
#[derive(Debug)]
pub struct MaxRequests {
    limit: u64,
    served: AtomicU64,
}

impl MaxRequests {
    /// Reloads after exactly `limit` requests (a limit of 0 is treated as 1).
    pub fn new(limit: u64) -> Self {
        Self::with_jitter(limit, JitterPolicy::None)
    }

    /// Reloads after `jitter.apply_count(limit)` requests (at least 1).
    pub fn with_jitter(limit: u64, jitter: JitterPolicy) -> Self {
        Self {
            limit: jitter.apply_count(limit).max(1),
            served: AtomicU64::new(0),
        }
    }

    /// Effective limit of this process.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Requests counted so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

impl ReloadStrategy for MaxRequests {
    fn should_reload(&self, event: &TriggerEvent) -> bool {
        if !matches!(event, TriggerEvent::Request) {
            return false;
        }
        self.served.fetch_add(1, Ordering::Relaxed) + 1 >= self.limit
    }

    fn name(&self) -> &'static str {
        "max_requests"
    }
}

/// Reloads once peak resident memory exceeds a limit.
#[derive(Clone, Copy, Debug)]
pub struct MemoryLimit {
    bytes: u64,
}

impl MemoryLimit {
    /// Limit in bytes.
    pub fn new(bytes: u64) -> Self {
        Self { bytes }
    }
}

impl ReloadStrategy for MemoryLimit {
    fn should_reload(&self, event: &TriggerEvent) -> bool {
        matches!(event, TriggerEvent::Memory { bytes } if *bytes > self.bytes)
    }

    fn name(&self) -> &'static str {
        "memory_limit"
    }
}

/// Timer strategy: reloads after a fixed (optionally jittered) lifetime.
#[derive(Clone, Copy, Debug)]
pub struct Interval {
    period: Duration,
}

impl Interval {
    /// Reloads every `period`.
    pub fn new(period: Duration) -> Self {
        Self::with_jitter(period, JitterPolicy::None)
    }

    /// Reloads after `jitter.apply(period)` (never zero).
    pub fn with_jitter(period: Duration, jitter: JitterPolicy) -> Self {
        Self {
            period: jitter.apply(period).max(Duration::from_millis(1)),
        }
    }
}

impl ReloadStrategy for Interval {
    fn should_reload(&self, event: &TriggerEvent) -> bool {
        matches!(event, TriggerEvent::Tick)
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.period)
    }

    fn name(&self) -> &'static str {
        "interval"
    }
}
