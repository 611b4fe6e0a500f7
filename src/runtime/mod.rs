//! Worker process runtime.
//!
//! - [`WorkerContext`]: handle passed to worker callbacks (stop, reload, detach, bus);
//! - [`WorkerProcess`]: handshake, heartbeats, signal handling and exit of one child.

mod context;
mod process;

pub use context::{Exit, WorkerContext};
pub use process::{peak_rss, WorkerProcess};
