//! # Worker abstraction.
//!
//! A [`Worker`] holds the lifecycle callbacks of one worker definition. They
//! run inside the worker process, never in the master:
//!
//! ```text
//! handshake acked ──► on_start(ctx)        (runs concurrently with signal handling)
//! SIGTERM / stop  ──► on_stop(&ctx)   ──► exit(code)
//! SIGUSR1 / reload──► on_reload(&ctx) ──► exit(RELOAD_EXIT_CODE)
//! ```
//!
//! `on_start` may run for the whole life of the process; it should watch
//! [`WorkerContext::cancellation`] and return promptly once it is cancelled.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::runtime::WorkerContext;

/// Shared handle to a worker implementation.
pub type WorkerRef = Arc<dyn Worker>;

/// # Lifecycle callbacks of a worker process.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use procvisor::{Worker, WorkerContext, WorkerError};
///
/// struct Poller;
///
/// #[async_trait]
/// impl Worker for Poller {
///     async fn on_start(&self, ctx: WorkerContext) -> Result<(), WorkerError> {
///         let token = ctx.cancellation();
///         while !token.is_cancelled() {
///             tokio::time::sleep(std::time::Duration::from_millis(100)).await;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Runs once the master knows about this process.
    ///
    /// An error is logged and fed to the reload trigger; the process keeps running.
    async fn on_start(&self, ctx: WorkerContext) -> Result<(), WorkerError>;

    /// Runs on graceful stop, before the process exits.
    async fn on_stop(&self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Runs on graceful reload, before the process exits with the reload code.
    async fn on_reload(&self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Instance override of the definition's `reloadable` flag.
    fn reloadable(&self) -> Option<bool> {
        None
    }
}
