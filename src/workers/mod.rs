//! # Worker abstractions and definitions.
//!
//! - [`Worker`] - lifecycle callbacks executed inside worker processes
//! - [`WorkerFn`] - closure-backed worker
//! - [`WorkerRef`] - shared handle (`Arc<dyn Worker>`)
//! - [`WorkerDefinition`] - count, identity and callbacks of one worker kind

mod definition;
mod worker;
mod worker_fn;

pub use definition::{WorkerDefinition, WorkerDefinitionBuilder};
pub use worker::{Worker, WorkerRef};
pub use worker_fn::WorkerFn;
