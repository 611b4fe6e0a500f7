//! # Bus listener: the master's local socket endpoint.
//!
//! Accepts connections from workers and CLI processes and serves each one in
//! its own task:
//!
//! ```text
//! UnixListener::accept ──► serve_connection(stream)
//!                            ├─ reader (this task): FramedRead ─► in-order handling
//!                            │     ├─ Event / Batch ─► MessageBus::deliver (inline, ordered)
//!                            │     └─ Command       ─► spawned: MessageBus::call ─► reply
//!                            └─ writer task: mpsc ─► FramedWrite (same correlation id)
//! ```
//!
//! ## Rules
//! - Frames of one connection are handled in arrival order; a batch is fully
//!   delivered before the next frame is read.
//! - Commands run concurrently, so a slow command never stalls heartbeats.
//! - A connection is dropped on the first codec error.
//! - Binding removes a stale socket file, but refuses to steal a socket that a
//!   live master still answers on.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::ipc::bus::MessageBus;
use crate::ipc::codec::{FrameCodec, Packet};
use crate::ipc::message::Message;

/// Running socket endpoint of a [`MessageBus`].
pub struct Listener {
    path: PathBuf,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    /// Binds `path` and starts accepting connections for `bus`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        bus: Arc<MessageBus>,
        path: impl AsRef<Path>,
        max_frame_len: usize,
    ) -> Result<Self, RuntimeError> {
        let path = path.as_ref().to_path_buf();
        let bind_err = |source: io::Error| RuntimeError::Bind {
            path: path.clone(),
            source,
        };

        if std::os::unix::net::UnixStream::connect(&path).is_ok() {
            return Err(bind_err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "another server is listening on this socket",
            )));
        }
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale bus socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }
        let listener = UnixListener::bind(&path).map_err(bind_err)?;

        let token = CancellationToken::new();
        let codec = FrameCodec::new(max_frame_len);
        let task = tokio::spawn(accept_loop(listener, bus, codec, token.clone()));

        tracing::info!(path = %path.display(), "bus listening");
        Ok(Self { path, token, task })
    }

    /// Socket file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting, closes open connections and removes the socket file.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove bus socket");
            }
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    bus: Arc<MessageBus>,
    codec: FrameCodec,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, _addr)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        Arc::clone(&bus),
                        codec.clone(),
                        token.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bus accept failed");
                }
            }
        }
    }
}

/// Serves one peer until it disconnects, misbehaves, or the listener stops.
pub(crate) async fn serve_connection(
    stream: UnixStream,
    bus: Arc<MessageBus>,
    codec: FrameCodec,
    token: CancellationToken,
) {
    let (read, write) = stream.into_split();
    let mut frames = FramedRead::new(read, codec.clone());
    let mut sink = FramedWrite::new(write, codec);

    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if let Err(e) = sink.send(packet).await {
                tracing::debug!(error = %e, "bus reply write failed");
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = frames.next() => next,
        };
        let Packet { id, message } = match next {
            None => break,
            Some(Ok(packet)) => packet,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "dropping bus connection");
                break;
            }
        };

        match message {
            Message::Command(cmd) => {
                let bus = Arc::clone(&bus);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let answer = Message::from(bus.call(cmd).await);
                    if id != 0 {
                        let _ = tx.send(Packet { id, message: answer });
                    }
                });
            }
            other => {
                if let Some(answer) = bus.deliver(other).await {
                    if id != 0 {
                        let _ = tx.send(Packet { id, message: answer });
                    }
                }
            }
        }
    }

    drop(tx);
    let _ = writer.await;
}
