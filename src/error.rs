//! Error types used by the procvisor runtime, the message bus and workers.
//!
//! This module defines four error enums:
//!
//! - [`RuntimeError`] — fatal errors of a master or worker process (startup aborts).
//! - [`BusError`] — transport errors surfaced to the caller of a dispatch.
//! - [`CodecError`] — framing/serialization errors of the IPC wire format.
//! - [`WorkerError`] — errors returned by user worker callbacks.
//!
//! All of them provide `as_label` (stable snake_case, for logs/metrics) and
//! `as_message` (human-readable details). Errors never cross process boundaries
//! as values of these types: the bus turns them into `Failure` frames and the
//! receiving side rebuilds a [`BusError`].

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// # Errors that abort a process.
///
/// In the master these are raised before any partial state is left running
/// (spawn failure, socket setup failure); in a worker they prevent the
/// runtime from announcing itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Duplicating the process for a worker failed.
    #[error("failed to spawn a process for worker {worker:?}: {source}")]
    Spawn {
        /// Worker definition name.
        worker: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The bus socket could not be bound.
    #[error("failed to bind bus socket {path:?}: {source}")]
    Bind {
        /// Socket file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Installing a signal listener failed.
    #[error("failed to install signal handler: {source}")]
    Signal {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A worker process was started for a definition id the server does not know.
    #[error("no worker definition with id {id}")]
    UnknownWorker {
        /// Requested definition id.
        id: u32,
    },

    /// The worker id in the environment is not a definition id.
    #[error("malformed worker id {value:?}")]
    InvalidWorkerId {
        /// Raw environment value.
        value: String,
    },

    /// The async runtime of the process could not be built.
    #[error("failed to build the async runtime: {source}")]
    Runtime {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A plugin refused to start.
    #[error("plugin {plugin:?} failed to start: {message}")]
    Plugin {
        /// Plugin name.
        plugin: String,
        /// Failure details.
        message: String,
    },

    /// A worker could not reach the master bus.
    #[error("bus failure: {0}")]
    Bus(#[from] BusError),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use procvisor::RuntimeError;
    ///
    /// let err = RuntimeError::UnknownWorker { id: 7 };
    /// assert_eq!(err.as_label(), "runtime_unknown_worker");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Spawn { .. } => "runtime_spawn_failed",
            RuntimeError::Bind { .. } => "runtime_bind_failed",
            RuntimeError::Signal { .. } => "runtime_signal_failed",
            RuntimeError::UnknownWorker { .. } => "runtime_unknown_worker",
            RuntimeError::InvalidWorkerId { .. } => "runtime_invalid_worker_id",
            RuntimeError::Runtime { .. } => "runtime_build_failed",
            RuntimeError::Plugin { .. } => "runtime_plugin_failed",
            RuntimeError::Bus(_) => "runtime_bus_failed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::Spawn { worker, source } => format!("spawn {worker}: {source}"),
            RuntimeError::Bind { path, source } => format!("bind {}: {source}", path.display()),
            RuntimeError::Signal { source } => format!("signal: {source}"),
            RuntimeError::UnknownWorker { id } => format!("unknown worker id={id}"),
            RuntimeError::InvalidWorkerId { value } => format!("malformed worker id {value:?}"),
            RuntimeError::Runtime { source } => format!("runtime: {source}"),
            RuntimeError::Plugin { plugin, message } => format!("plugin {plugin}: {message}"),
            RuntimeError::Bus(e) => e.as_message(),
        }
    }
}

/// # Errors of the IPC wire format.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CodecError {
    /// Socket read/write failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Payload could not be (de)serialized.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// A frame announced a length above the configured maximum.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The frame header is inconsistent (bad tag length or non UTF-8 tag).
    #[error("malformed frame header")]
    MalformedHeader,

    /// The header tag does not describe the decoded payload.
    #[error("frame tag {header:?} does not match payload {payload:?}")]
    TagMismatch {
        /// Tag found in the header.
        header: String,
        /// Tag of the decoded message.
        payload: String,
    },
}

/// # Errors surfaced to the caller of a bus dispatch.
///
/// A dispatch never hangs on these conditions: the awaitable resolves to one
/// of the variants below.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// No handler is registered for the dispatched command.
    #[error("no handler registered for {command}")]
    NoHandler {
        /// Command tag.
        command: String,
    },

    /// A handler on the other side reported a failure.
    #[error("remote failure [{label}]: {message}")]
    Remote {
        /// Stable label of the remote error.
        label: String,
        /// Remote error message.
        message: String,
    },

    /// A local handler failed while serving a command.
    #[error("handler failed: {message}")]
    Handler {
        /// Failure description.
        message: String,
    },

    /// The peer went away before answering (or the bus is already closed).
    #[error("bus peer disconnected")]
    Disconnected,

    /// No reply arrived within the configured timeout.
    #[error("no reply within {timeout:?}")]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The reply did not have the expected shape.
    #[error("unexpected reply: {tag}")]
    UnexpectedReply {
        /// Tag of the unexpected message.
        tag: String,
    },

    /// Wire format failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Socket connect/accept failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BusError {
    /// Builds a handler failure from anything printable.
    pub fn handler(message: impl ToString) -> Self {
        BusError::Handler {
            message: message.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// The label also travels inside `Failure` frames so the caller side can
    /// rebuild the error kind.
    ///
    /// # Example
    /// ```
    /// use procvisor::BusError;
    ///
    /// let err = BusError::NoHandler { command: "ContainerGet".into() };
    /// assert_eq!(err.as_label(), "bus_no_handler");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::NoHandler { .. } => "bus_no_handler",
            BusError::Remote { .. } => "bus_remote",
            BusError::Handler { .. } => "bus_handler_failed",
            BusError::Disconnected => "bus_disconnected",
            BusError::Timeout { .. } => "bus_timeout",
            BusError::UnexpectedReply { .. } => "bus_unexpected_reply",
            BusError::Codec(_) => "bus_codec",
            BusError::Io(_) => "bus_io",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            BusError::NoHandler { command } => format!("no handler: {command}"),
            BusError::Remote { label, message } => format!("{label}: {message}"),
            BusError::Handler { message } => format!("handler: {message}"),
            BusError::Disconnected => "disconnected".to_string(),
            BusError::Timeout { timeout } => format!("timeout: {timeout:?}"),
            BusError::UnexpectedReply { tag } => format!("unexpected reply: {tag}"),
            BusError::Codec(e) => format!("codec: {e}"),
            BusError::Io(e) => format!("io: {e}"),
        }
    }

    /// Returns true if the error was produced because no handler exists.
    pub fn is_no_handler(&self) -> bool {
        matches!(self, BusError::NoHandler { .. })
    }
}

/// # Errors returned by worker callbacks.
///
/// A failing `on_start` is not fatal to the worker process: the runtime logs it
/// and feeds it to the reload trigger as an exception.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Callback failed.
    #[error("worker failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Callback observed cancellation and gave up.
    #[error("worker cancelled")]
    Canceled,
}

impl WorkerError {
    /// Builds a [`WorkerError::Fail`] from anything printable.
    pub fn fail(error: impl ToString) -> Self {
        WorkerError::Fail {
            error: error.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::Fail { .. } => "worker_failed",
            WorkerError::Canceled => "worker_canceled",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            WorkerError::Fail { error } => format!("error: {error}"),
            WorkerError::Canceled => "cancelled".to_string(),
        }
    }
}
