//! # ReloadTrigger: evaluates reload strategies inside one worker process.
//!
//! ```text
//! worker code ──► trigger.emit(event) ──► strategy[0] ─► strategy[1] ─► ...  (first match wins)
//!                                                   │
//! timer task (one per timer strategy) ──────────────┤
//!                                                   ▼
//!                                   fire(strategy) ──► mpsc ──► WorkerProcess loop ──► reload()
//! ```
//!
//! ## Rules
//! - `emit` never reloads synchronously: the request is queued and handled by
//!   the worker's control loop on a later turn, so the caller's own dispatch is
//!   never re-entered.
//! - At most one request is queued per process; later matches are still
//!   reported by `emit` but not queued again.
//! - Timer strategies are never evaluated by `emit`; they only see their own ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::reload::strategy::{ReloadStrategy, TriggerEvent};

/// Reload request queued for the worker's control loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReloadRequest {
    /// Name of the strategy that matched.
    pub strategy: &'static str,
}

/// Ordered list of reload strategies owned by one worker process.
pub struct ReloadTrigger {
    strategies: Vec<Arc<dyn ReloadStrategy>>,
    fired: AtomicBool,
    tx: mpsc::UnboundedSender<ReloadRequest>,
}

impl ReloadTrigger {
    /// Creates a trigger and the receiving end of its reload requests.
    pub fn new(
        strategies: Vec<Arc<dyn ReloadStrategy>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ReloadRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let trigger = Arc::new(Self {
            strategies,
            fired: AtomicBool::new(false),
            tx,
        });
        (trigger, rx)
    }

    /// Number of configured strategies.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// True if no strategy is configured.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// True once a reload has been requested.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Feeds `event` to the event-driven strategies in order.
    ///
    /// Returns true if a strategy matched (a reload is, or already was, requested).
    pub fn emit(&self, event: &TriggerEvent) -> bool {
        let matched = self
            .strategies
            .iter()
            .filter(|s| s.interval().is_none())
            .find(|s| s.should_reload(event));
        match matched {
            Some(strategy) => {
                self.fire(strategy.name());
                true
            }
            None => false,
        }
    }

    /// Counts one served request.
    pub fn request(&self) -> bool {
        self.emit(&TriggerEvent::Request)
    }

    /// Spawns one periodic task per timer strategy; they stop with `token`.
    pub fn start_timers(self: &Arc<Self>, token: &CancellationToken) -> usize {
        let mut started = 0;
        for strategy in &self.strategies {
            let Some(period) = strategy.interval() else {
                continue;
            };
            let me = Arc::clone(self);
            let strategy = Arc::clone(strategy);
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticks.tick() => {
                            if strategy.should_reload(&TriggerEvent::Tick) {
                                me.fire(strategy.name());
                            }
                        }
                    }
                }
            });
            started += 1;
        }
        started
    }

    fn fire(&self, strategy: &'static str) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(strategy, "reload requested");
        let _ = self.tx.send(ReloadRequest { strategy });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::strategy::{Interval, MaxRequests, MemoryLimit, OnException};
    use std::time::Duration;

    fn arc<S: ReloadStrategy>(s: S) -> Arc<dyn ReloadStrategy> {
        Arc::new(s)
    }

    #[tokio::test]
    async fn first_matching_strategy_wins_and_reload_is_deferred() {
        let (trigger, mut rx) = ReloadTrigger::new(vec![
            arc(MemoryLimit::new(100)),
            arc(OnException::any()),
            arc(OnException::matching("boom")),
        ]);

        assert!(!trigger.emit(&TriggerEvent::Request));
        assert!(rx.try_recv().is_err());

        assert!(trigger.emit(&TriggerEvent::exception("boom")));
        assert_eq!(
            rx.recv().await,
            Some(ReloadRequest {
                strategy: "on_exception"
            })
        );
    }

    #[tokio::test]
    async fn requests_are_queued_once() {
        let (trigger, mut rx) = ReloadTrigger::new(vec![arc(MaxRequests::new(2))]);

        assert!(!trigger.request());
        assert!(!trigger.is_fired());
        assert!(trigger.request());
        assert!(trigger.request());
        assert!(trigger.is_fired());

        assert_eq!(rx.recv().await.map(|r| r.strategy), Some("max_requests"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn memory_event_fires_the_limit() {
        let (trigger, mut rx) = ReloadTrigger::new(vec![arc(MemoryLimit::new(1024))]);
        assert!(!trigger.emit(&TriggerEvent::Memory { bytes: 512 }));
        assert!(trigger.emit(&TriggerEvent::Memory { bytes: 4096 }));
        assert_eq!(rx.recv().await.map(|r| r.strategy), Some("memory_limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_strategy_fires_on_its_own_tick() {
        let (trigger, mut rx) =
            ReloadTrigger::new(vec![arc(Interval::new(Duration::from_secs(30)))]);
        assert!(!trigger.emit(&TriggerEvent::Tick));

        let token = CancellationToken::new();
        assert_eq!(trigger.start_timers(&token), 1);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        let req = rx.recv().await;
        assert_eq!(req.map(|r| r.strategy), Some("interval"));
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_never_fire() {
        let (trigger, mut rx) =
            ReloadTrigger::new(vec![arc(Interval::new(Duration::from_secs(5)))]);
        let token = CancellationToken::new();
        trigger.start_timers(&token);
        token.cancel();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(!trigger.is_fired());
    }
}
