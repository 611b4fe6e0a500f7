//! # Plugins: in-master components started before workers and stopped after them.
//!
//! A plugin receives the master bus and the shared status, so it can register
//! command handlers or subscribers (HTTP front-ends, metrics exporters, status
//! aggregators) without reaching into the supervisor.
//!
//! ```text
//! STARTING ──► plugin.start() (registration order) ──► workers spawned ──► RUNNING
//! STOPPING ──► workers drained ──► plugin.stop() (reverse order) ──► SHUTDOWN
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::status::StatusCell;
use crate::error::RuntimeError;
use crate::ipc::MessageBus;

/// Shared handle to a plugin.
pub type PluginRef = Arc<dyn Plugin>;

/// Component living inside the master process.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Starts the plugin; an error aborts master startup.
    async fn start(&self, bus: Arc<MessageBus>, status: StatusCell) -> Result<(), RuntimeError>;

    /// Stops the plugin after every worker exited.
    async fn stop(&self) {}
}
