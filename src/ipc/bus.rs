//! # MessageBus: master-side command routing and event fan-out.
//!
//! The [`MessageBus`] owns two typed tables:
//! - **commands**: exactly one handler per [`CommandKind`]; a command without a
//!   handler fails with [`BusError::NoHandler`] instead of being dropped;
//! - **events**: ordered [`Subscriptions`] per [`EventKind`].
//!
//! ## Architecture
//! ```text
//! CLI / worker ──frame──► listener::serve_connection ──► MessageBus::deliver(msg)
//!                                                           ├─ Event   ─► Subscriptions::emit
//!                                                           ├─ Command ─► handler(cmd).await ─► Reply | Failure
//!                                                           └─ Batch   ─► each item in order ─► Ack
//!
//! in-process callers (master, plugins) ──► MessageBus::dispatch / publish
//! ```
//!
//! The same operations are available remotely through
//! [`BusClient`](crate::BusClient); both implement [`Dispatch`], the interface
//! handed to collaborators (listeners, CLI commands, metrics).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::error::BusError;
use crate::ipc::message::{Command, CommandKind, Event, EventKind, Message, Reply};
use crate::ipc::subscriptions::Subscriptions;
use crate::subscribers::Subscribe;

/// Boxed future returned by command handlers.
pub type CommandFuture = BoxFuture<'static, Result<Reply, BusError>>;

/// Shared command handler.
pub type CommandHandler = Arc<dyn Fn(Command) -> CommandFuture + Send + Sync>;

/// Collaborator interface of the bus: command dispatch plus event publishing.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Sends a command and waits for its single reply.
    async fn dispatch(&self, command: Command) -> Result<Reply, BusError>;

    /// Delivers several messages in order and waits for the single acknowledgement.
    async fn dispatch_batch(&self, messages: Vec<Message>) -> Result<(), BusError>;

    /// Publishes an event without waiting for delivery.
    fn publish(&self, event: Event) -> Result<(), BusError>;
}

/// Master-side bus: command table plus event subscriptions.
pub struct MessageBus {
    commands: RwLock<[Option<CommandHandler>; CommandKind::COUNT]>,
    subscriptions: Subscriptions,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Creates a bus with no handlers and no subscribers.
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(std::array::from_fn(|_| None)),
            subscriptions: Subscriptions::new(),
        }
    }

    /// Registers the handler of `kind`, replacing any previous one.
    ///
    /// Returns true if a handler was replaced.
    pub fn handle<F, Fut>(&self, kind: CommandKind, f: F) -> bool
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, BusError>> + Send + 'static,
    {
        let handler: CommandHandler = Arc::new(move |cmd| f(cmd).boxed());
        let previous = self.commands.write()[kind.index()].replace(handler);
        if previous.is_some() {
            tracing::debug!(command = kind.as_str(), "command handler replaced");
        }
        previous.is_some()
    }

    /// True if a handler is registered for `kind`.
    pub fn has_handler(&self, kind: CommandKind) -> bool {
        self.commands.read()[kind.index()].is_some()
    }

    /// Appends an event subscriber for `kind`.
    pub fn subscribe(&self, kind: EventKind, sub: Arc<dyn Subscribe>) {
        self.subscriptions.subscribe(kind, sub);
    }

    /// Delivers an event to local subscribers; returns how many were invoked.
    pub fn emit(&self, event: &Event) -> usize {
        self.subscriptions.emit(event)
    }

    /// Routes a command to its handler.
    pub async fn call(&self, command: Command) -> Result<Reply, BusError> {
        let kind = command.kind();
        let handler = self.commands.read()[kind.index()].clone();
        match handler {
            Some(handler) => handler(command).await,
            None => Err(BusError::NoHandler {
                command: kind.as_str().to_string(),
            }),
        }
    }

    /// Handles a message received from a peer; returns the answer to send back, if any.
    ///
    /// Batches are unpacked and delivered in their original order, then
    /// acknowledged once (or answered with the first failure).
    pub fn deliver(&self, message: Message) -> BoxFuture<'_, Option<Message>> {
        async move {
            match message {
                Message::Event(ev) => {
                    self.emit(&ev);
                    None
                }
                Message::Command(cmd) => Some(Message::from(self.call(cmd).await)),
                Message::Batch(items) => {
                    for item in items {
                        if let Some(failure @ Message::Failure(_)) = self.deliver(item).await {
                            return Some(failure);
                        }
                    }
                    Some(Message::Reply(Reply::Ack))
                }
                other @ (Message::Reply(_) | Message::Failure(_)) => {
                    tracing::debug!(tag = other.tag(), "ignoring unsolicited reply on master bus");
                    None
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl Dispatch for MessageBus {
    async fn dispatch(&self, command: Command) -> Result<Reply, BusError> {
        self.call(command).await
    }

    async fn dispatch_batch(&self, messages: Vec<Message>) -> Result<(), BusError> {
        match self.deliver(Message::Batch(messages)).await {
            Some(Message::Failure(failure)) => Err(BusError::from(failure)),
            _ => Ok(()),
        }
    }

    fn publish(&self, event: Event) -> Result<(), BusError> {
        self.emit(&event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribers::SubscribeFn;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn command_without_handler_is_an_error() {
        let bus = MessageBus::new();
        let err = bus
            .dispatch(Command::ContainerGet { id: "x".into() })
            .await
            .unwrap_err();
        assert!(err.is_no_handler());
    }

    #[tokio::test]
    async fn command_reaches_its_single_handler() {
        let bus = MessageBus::new();
        assert!(!bus.handle(CommandKind::ReloadServer, |_cmd| async {
            Ok::<_, BusError>(Reply::Ack)
        }));
        assert!(bus.handle(CommandKind::ReloadServer, |_cmd| async {
            Ok::<_, BusError>(Reply::Value(Some(serde_json::json!(2))))
        }));

        let reply = bus.dispatch(Command::ReloadServer).await.unwrap();
        assert_eq!(reply, Reply::Value(Some(serde_json::json!(2))));
    }

    #[tokio::test]
    async fn batch_is_delivered_in_order_and_acknowledged_once() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::ProcessSpawned, EventKind::ProcessHeartbeat] {
            let seen = Arc::clone(&seen);
            bus.subscribe(
                kind,
                SubscribeFn::arc("order", move |ev: &Event| seen.lock().push(ev.kind())),
            );
        }

        let batch = Message::Batch(vec![
            Message::Event(Event::ProcessSpawned {
                pid: 5,
                user: None,
                name: "w".into(),
                started_at: std::time::SystemTime::now(),
                reloadable: None,
            }),
            Message::Event(Event::ProcessHeartbeat {
                pid: 5,
                memory: 0,
                time: std::time::SystemTime::now(),
            }),
        ]);
        let answer = bus.deliver(batch).await;

        assert_eq!(answer, Some(Message::Reply(Reply::Ack)));
        assert_eq!(
            *seen.lock(),
            vec![EventKind::ProcessSpawned, EventKind::ProcessHeartbeat]
        );
    }

    #[tokio::test]
    async fn batch_reports_the_first_failing_command() {
        let bus = MessageBus::new();
        let answer = bus
            .deliver(Message::Batch(vec![Message::Command(Command::StopServer)]))
            .await;
        match answer {
            Some(Message::Failure(f)) => assert_eq!(f.label, "bus_no_handler"),
            other => panic!("unexpected answer: {other:?}"),
        }
    }
}
