//! # Function-backed worker (`WorkerFn`)
//!
//! [`WorkerFn`] wraps a closure `F: Fn(WorkerContext) -> Fut` as the
//! [`Worker::on_start`] callback; stop and reload use the default no-op hooks.
//!
//! ## Example
//! ```rust
//! use procvisor::{WorkerContext, WorkerError, WorkerFn, WorkerRef};
//!
//! let w: WorkerRef = WorkerFn::arc(|ctx: WorkerContext| async move {
//!     ctx.cancellation().cancelled().await;
//!     Ok::<_, WorkerError>(())
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::runtime::WorkerContext;
use crate::workers::worker::Worker;

/// Closure-backed worker.
#[derive(Debug)]
pub struct WorkerFn<F> {
    f: F,
}

impl<F> WorkerFn<F> {
    /// Wraps `f` as an `on_start` callback.
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Wraps `f` and returns it as a shared handle.
    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> Worker for WorkerFn<F>
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    async fn on_start(&self, ctx: WorkerContext) -> Result<(), WorkerError> {
        (self.f)(ctx).await
    }
}
