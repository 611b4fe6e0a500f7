//! # Messages exchanged over the bus.
//!
//! Two flavors share one envelope ([`Message`]):
//! - **events** ([`Event`]): fire-and-forget lifecycle telemetry from workers
//!   (spawned, heartbeat, detached) or from the supervisor (blocked, exit);
//! - **commands** ([`Command`]): requests that expect exactly one [`Reply`] or
//!   [`Failure`] carrying the same correlation id.
//!
//! [`Message::Batch`] groups several messages for ordered delivery in a single
//! round trip (a worker announces `ProcessSpawned` and its first
//! `ProcessHeartbeat` this way, so the pool knows the process before its first
//! heartbeat is observed).
//!
//! [`EventKind`] and [`CommandKind`] are the field-less discriminants used as
//! indexes of the dispatch tables.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::core::ServerStatus;
use crate::error::BusError;

/// OS process id as carried on the wire.
pub type Pid = u32;

/// Fire-and-forget lifecycle events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// A worker process finished its startup handshake.
    ProcessSpawned {
        /// Worker process id.
        pid: Pid,
        /// Effective user name, when the worker switched users.
        user: Option<String>,
        /// Worker definition name.
        name: String,
        /// Wall-clock start time of the process.
        started_at: SystemTime,
        /// Instance override of the definition's `reloadable` flag.
        reloadable: Option<bool>,
    },
    /// Periodic liveness signal of a worker.
    ProcessHeartbeat {
        /// Worker process id.
        pid: Pid,
        /// Peak resident memory in bytes.
        memory: u64,
        /// Wall-clock time the heartbeat was produced.
        time: SystemTime,
    },
    /// The worker left the managed lifecycle (no more heartbeats or reloads).
    ProcessDetached {
        /// Worker process id.
        pid: Pid,
    },
    /// The supervisor noticed an overdue heartbeat.
    ProcessBlocked {
        /// Worker process id.
        pid: Pid,
    },
    /// The supervisor reaped a worker.
    ProcessExit {
        /// Worker process id.
        pid: Pid,
        /// Exit code (`128 + signo` for signal deaths).
        exit_code: i32,
    },
}

/// Discriminant of [`Event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ProcessSpawned,
    ProcessHeartbeat,
    ProcessDetached,
    ProcessBlocked,
    ProcessExit,
}

impl EventKind {
    /// Number of event kinds (size of per-kind tables).
    pub const COUNT: usize = 5;

    /// Every kind, in index order.
    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::ProcessSpawned,
        EventKind::ProcessHeartbeat,
        EventKind::ProcessDetached,
        EventKind::ProcessBlocked,
        EventKind::ProcessExit,
    ];

    /// Slot of this kind in per-kind tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Wire tag of this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::ProcessSpawned => "ProcessSpawned",
            EventKind::ProcessHeartbeat => "ProcessHeartbeat",
            EventKind::ProcessDetached => "ProcessDetached",
            EventKind::ProcessBlocked => "ProcessBlocked",
            EventKind::ProcessExit => "ProcessExit",
        }
    }
}

impl Event {
    /// Returns the discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ProcessSpawned { .. } => EventKind::ProcessSpawned,
            Event::ProcessHeartbeat { .. } => EventKind::ProcessHeartbeat,
            Event::ProcessDetached { .. } => EventKind::ProcessDetached,
            Event::ProcessBlocked { .. } => EventKind::ProcessBlocked,
            Event::ProcessExit { .. } => EventKind::ProcessExit,
        }
    }

    /// Returns the process the event is about.
    pub fn pid(&self) -> Pid {
        match self {
            Event::ProcessSpawned { pid, .. }
            | Event::ProcessHeartbeat { pid, .. }
            | Event::ProcessDetached { pid }
            | Event::ProcessBlocked { pid }
            | Event::ProcessExit { pid, .. } => *pid,
        }
    }
}

/// Requests that expect exactly one reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Gracefully stop the whole server.
    StopServer,
    /// Reload every reloadable worker.
    ReloadServer,
    /// Read a value from the master container.
    ContainerGet {
        /// Entry id.
        id: String,
    },
    /// Store a value in the master container.
    ContainerSet {
        /// Entry id.
        id: String,
        /// Entry value.
        value: serde_json::Value,
    },
    /// List the supervised processes.
    GetSupervisorStatus,
    /// Describe the master process.
    GetServerStatus,
}

/// Discriminant of [`Command`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    StopServer,
    ReloadServer,
    ContainerGet,
    ContainerSet,
    GetSupervisorStatus,
    GetServerStatus,
}

impl CommandKind {
    /// Number of command kinds (size of per-kind tables).
    pub const COUNT: usize = 6;

    /// Every kind, in index order.
    pub const ALL: [CommandKind; Self::COUNT] = [
        CommandKind::StopServer,
        CommandKind::ReloadServer,
        CommandKind::ContainerGet,
        CommandKind::ContainerSet,
        CommandKind::GetSupervisorStatus,
        CommandKind::GetServerStatus,
    ];

    /// Slot of this kind in per-kind tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Wire tag of this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandKind::StopServer => "StopServer",
            CommandKind::ReloadServer => "ReloadServer",
            CommandKind::ContainerGet => "ContainerGet",
            CommandKind::ContainerSet => "ContainerSet",
            CommandKind::GetSupervisorStatus => "GetSupervisorStatus",
            CommandKind::GetServerStatus => "GetServerStatus",
        }
    }
}

impl Command {
    /// Returns the discriminant of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::StopServer => CommandKind::StopServer,
            Command::ReloadServer => CommandKind::ReloadServer,
            Command::ContainerGet { .. } => CommandKind::ContainerGet,
            Command::ContainerSet { .. } => CommandKind::ContainerSet,
            Command::GetSupervisorStatus => CommandKind::GetSupervisorStatus,
            Command::GetServerStatus => CommandKind::GetServerStatus,
        }
    }
}

/// One supervised process, as reported by `GetSupervisorStatus`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub worker_id: u32,
    pub worker: String,
    pub user: Option<String>,
    pub started_at: Option<SystemTime>,
    pub uptime: Duration,
    pub heartbeat_age: Duration,
    pub memory: u64,
    pub detached: bool,
    pub blocked: bool,
    pub reloadable: bool,
}

/// The master process, as reported by `GetServerStatus`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub pid: Pid,
    pub status: ServerStatus,
    pub started_at: SystemTime,
    pub workers: usize,
    pub processes: usize,
}

/// Successful command results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Command accepted; nothing to return.
    Ack,
    /// Container lookup result.
    Value(Option<serde_json::Value>),
    /// Supervised processes.
    Supervisor(Vec<ProcessInfo>),
    /// Master process description.
    Server(ServerInfo),
}

/// Error reply; the value form of a [`BusError`] on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Stable label of the error (see [`BusError::as_label`]).
    pub label: String,
    /// Details; for `bus_no_handler` this is the command tag.
    pub message: String,
}

impl From<&BusError> for Failure {
    fn from(err: &BusError) -> Self {
        let message = match err {
            BusError::NoHandler { command } => command.clone(),
            BusError::Remote { message, .. } => message.clone(),
            BusError::Handler { message } => message.clone(),
            other => other.to_string(),
        };
        Failure {
            label: err.as_label().to_string(),
            message,
        }
    }
}

impl From<Failure> for BusError {
    fn from(failure: Failure) -> Self {
        if failure.label == "bus_no_handler" {
            BusError::NoHandler {
                command: failure.message,
            }
        } else {
            BusError::Remote {
                label: failure.label,
                message: failure.message,
            }
        }
    }
}

/// Envelope of everything that travels on the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Command(Command),
    Event(Event),
    /// Composite message: constituents are delivered in order, acknowledged once.
    Batch(Vec<Message>),
    Reply(Reply),
    Failure(Failure),
}

impl Message {
    /// Tag written into the frame header.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Command(cmd) => cmd.kind().as_str(),
            Message::Event(ev) => ev.kind().as_str(),
            Message::Batch(_) => "Composite",
            Message::Reply(_) => "Reply",
            Message::Failure(_) => "Failure",
        }
    }

    /// Returns true if the sender expects an answer to this message.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Message::Command(_) | Message::Batch(_))
    }
}

impl From<Event> for Message {
    fn from(ev: Event) -> Self {
        Message::Event(ev)
    }
}

impl From<Command> for Message {
    fn from(cmd: Command) -> Self {
        Message::Command(cmd)
    }
}

impl From<Result<Reply, BusError>> for Message {
    fn from(res: Result<Reply, BusError>) -> Self {
        match res {
            Ok(reply) => Message::Reply(reply),
            Err(err) => Message::Failure(Failure::from(&err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_indexes_match_table_order() {
        for (i, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        for (i, kind) in CommandKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn tags_follow_the_inner_kind() {
        let get = Message::from(Command::ContainerGet { id: "x".into() });
        assert_eq!(get.tag(), "ContainerGet");
        assert!(get.expects_reply());

        let exit = Message::from(Event::ProcessExit {
            pid: 7,
            exit_code: 100,
        });
        assert_eq!(exit.tag(), "ProcessExit");
        assert!(!exit.expects_reply());
        assert_eq!(Message::Batch(vec![]).tag(), "Composite");
    }

    #[test]
    fn no_handler_survives_the_failure_round_trip() {
        let err = BusError::NoHandler {
            command: "ContainerGet".into(),
        };
        let back = BusError::from(Failure::from(&err));
        assert!(back.is_no_handler());

        let err = BusError::handler("no entry registered for \"x\"");
        match BusError::from(Failure::from(&err)) {
            BusError::Remote { label, message } => {
                assert_eq!(label, "bus_handler_failed");
                assert_eq!(message, "no entry registered for \"x\"");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
