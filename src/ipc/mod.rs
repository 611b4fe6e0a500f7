//! Inter-process message bus: wire format, routing tables and endpoints.
//!
//! This module groups the message **data model**, the frame **codec**, the
//! master-side [`MessageBus`] with its socket [`Listener`], and the
//! [`BusClient`] used by workers and CLI processes.
//!
//! ## Contents
//! - [`Message`], [`Event`], [`Command`], [`Reply`], [`Failure`]: envelopes and payloads
//! - [`FrameCodec`], [`Packet`]: length-delimited framing with correlation ids
//! - [`Subscriptions`]: ordered per-kind event handlers (snapshot delivery)
//! - [`MessageBus`], [`Dispatch`]: command table + event fan-out
//! - [`Listener`]: Unix socket endpoint serving a [`MessageBus`]
//! - [`BusClient`]: request/response + publish over one connection
//!
//! ## Quick reference
//! - **Publishers**: worker runtime (spawned, heartbeat, detached) and the
//!   supervisor (blocked, exit).
//! - **Command callers**: CLI processes, workers (container access), plugins.
//! - **Consumers**: supervisor pool bookkeeping, user subscribers.

mod bus;
mod client;
mod codec;
mod listener;
mod message;
mod subscriptions;

pub use bus::{CommandFuture, CommandHandler, Dispatch, MessageBus};
pub use client::{BusClient, ClientOptions};
pub use codec::{FrameCodec, Packet};
pub use listener::Listener;
pub use message::{
    Command, CommandKind, Event, EventKind, Failure, Message, Pid, ProcessInfo, Reply, ServerInfo,
};
pub use subscriptions::Subscriptions;
