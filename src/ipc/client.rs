//! # BusClient: worker / CLI side of the bus.
//!
//! ```text
//! dispatch(cmd) ──► id = next_id ──► pending[id] = oneshot ──► writer task ──► socket
//!                                                                          │
//! socket ──► reader task ──► Reply/Failure{id} ──► pending.remove(id).send(result)
//!                        └─► EOF / codec error ──► every pending call: Disconnected
//! ```
//!
//! ## Rules
//! - Every dispatch resolves exactly once: with the reply, the remote failure,
//!   [`BusError::Disconnected`], or [`BusError::Timeout`] when a timeout is set.
//! - [`BusClient::publish`] only enqueues the frame; the writer task preserves
//!   the order of everything sent through one client.
//! - Dropping the client flushes frames already queued, then closes the socket.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::BusError;
use crate::ipc::bus::Dispatch;
use crate::ipc::codec::{FrameCodec, Packet};
use crate::ipc::message::{Command, Event, Message, Reply};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, BusError>>>>>;

/// Connection options of a [`BusClient`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Largest accepted frame in bytes.
    pub max_frame_len: usize,
    /// Per-call reply timeout (`None` = wait until reply or disconnect).
    pub timeout: Option<Duration>,
}

impl Default for ClientOptions {
    /// `max_frame_len = 16 MiB`, `timeout = None`.
    fn default() -> Self {
        Self {
            max_frame_len: 16 * 1024 * 1024,
            timeout: None,
        }
    }
}

/// Connection to a master bus.
pub struct BusClient {
    tx: mpsc::UnboundedSender<Packet>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
    timeout: Option<Duration>,
    reader: JoinHandle<()>,
}

impl BusClient {
    /// Connects with default options.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, BusError> {
        Self::connect_with(path, ClientOptions::default()).await
    }

    /// Connects to the bus socket at `path`.
    pub async fn connect_with(
        path: impl AsRef<Path>,
        options: ClientOptions,
    ) -> Result<Self, BusError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read, write) = stream.into_split();
        let codec = FrameCodec::new(options.max_frame_len);
        let frames = FramedRead::new(read, codec.clone());
        let mut sink = FramedWrite::new(write, codec);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = sink.send(packet).await {
                    tracing::debug!(error = %e, "bus write failed");
                    writer_closed.cancel();
                    break;
                }
            }
        });

        let reader = tokio::spawn(read_replies(frames, Arc::clone(&pending), closed.clone()));

        Ok(Self {
            tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            timeout: options.timeout,
            reader,
        })
    }

    /// Sends a command and waits for its reply.
    pub async fn dispatch(&self, command: Command) -> Result<Reply, BusError> {
        self.request(Message::Command(command)).await
    }

    /// Sends several messages as one composite and waits for the single acknowledgement.
    pub async fn dispatch_batch(&self, messages: Vec<Message>) -> Result<(), BusError> {
        match self.request(Message::Batch(messages)).await? {
            Reply::Ack => Ok(()),
            other => Err(BusError::UnexpectedReply {
                tag: format!("{other:?}"),
            }),
        }
    }

    /// Queues an event for sending; does not wait for the write.
    pub fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Disconnected);
        }
        self.tx
            .send(Packet::new(0, event))
            .map_err(|_| BusError::Disconnected)
    }

    /// True once the connection is known to be gone.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn request(&self, message: Message) -> Result<Reply, BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Disconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);

        // The reader may have drained `pending` before the insert above.
        if self.closed.is_cancelled() || self.tx.send(Packet { id, message }).is_err() {
            self.pending.lock().remove(&id);
            return Err(BusError::Disconnected);
        }

        let outcome = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reply_rx).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    self.pending.lock().remove(&id);
                    return Err(BusError::Timeout { timeout });
                }
            },
            None => reply_rx.await,
        };
        outcome.unwrap_or(Err(BusError::Disconnected))
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Dispatch for BusClient {
    async fn dispatch(&self, command: Command) -> Result<Reply, BusError> {
        BusClient::dispatch(self, command).await
    }

    async fn dispatch_batch(&self, messages: Vec<Message>) -> Result<(), BusError> {
        BusClient::dispatch_batch(self, messages).await
    }

    fn publish(&self, event: Event) -> Result<(), BusError> {
        BusClient::publish(self, event)
    }
}

async fn read_replies(
    mut frames: FramedRead<tokio::net::unix::OwnedReadHalf, FrameCodec>,
    pending: Pending,
    closed: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            None => break,
            Some(Ok(Packet { id, message })) => {
                let result = match message {
                    Message::Reply(reply) => Ok(reply),
                    Message::Failure(failure) => Err(BusError::from(failure)),
                    other => {
                        tracing::debug!(tag = other.tag(), "ignoring unsolicited bus message");
                        continue;
                    }
                };
                if let Some(waiter) = pending.lock().remove(&id) {
                    let _ = waiter.send(result);
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "bus connection failed");
                break;
            }
        }
    }

    closed.cancel();
    let waiters: Vec<_> = pending.lock().drain().map(|(_, w)| w).collect();
    for waiter in waiters {
        let _ = waiter.send(Err(BusError::Disconnected));
    }
}
