//! Byte-stream connections.
//!
//! A [`Connection`] is an ordered, reliable byte channel driven by a
//! background task. Writes and closes are non-blocking enqueues on a command
//! channel; the driver reports received chunks, completed writes and the
//! final close as [`StreamEvent`]s. Exactly one `Closed` event is emitted per
//! connection, after which the event channel ends.

use crate::SessionError;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, trace};

/// Read buffer reserved before every socket read
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Capacity of in-memory duplex pipes
const DUPLEX_CAPACITY: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Events reported by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk of bytes arrived
    Received(Bytes),
    /// One earlier write was fully handed to the transport
    Sent,
    /// The connection closed; `error` is set if it failed
    Closed {
        /// Failure description, if the close was not orderly
        error: Option<String>,
    },
}

/// Instructions for a connection driver
#[derive(Debug)]
pub(crate) enum Command {
    Write(Bytes),
    Close,
}

/// Cloneable write side of a connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a write. A `Sent` event follows once it is flushed.
    pub fn write(&self, data: Bytes) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Closed(None));
        }
        self.commands
            .send(Command::Write(data))
            .map_err(|_| SessionError::Closed(None))
    }

    /// Request an orderly close
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Whether the connection is still open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Boxed stream of connection events
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Driver side of a channel-backed connection
#[derive(Debug)]
pub(crate) struct ConnectionEndpoint {
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) events: mpsc::UnboundedSender<StreamEvent>,
    pub(crate) connected: Arc<AtomicBool>,
}

impl ConnectionEndpoint {
    /// Mark the connection closed and emit the final event
    pub(crate) fn finish(&self, error: Option<String>) {
        self.connected.store(false, Ordering::Release);
        let _ = self.events.send(StreamEvent::Closed { error });
    }
}

/// An open byte-stream connection
pub struct Connection {
    handle: ConnectionHandle,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    stash: VecDeque<Bytes>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.handle.id)
            .field("connected", &self.handle.is_connected())
            .field("stashed", &self.stash.len())
            .finish()
    }
}

impl Connection {
    /// Create a connection whose driver is the returned endpoint
    pub(crate) fn channel() -> (Connection, ConnectionEndpoint) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let connection = Connection {
            handle: ConnectionHandle {
                id: ConnectionId::next(),
                commands: commands_tx,
                connected: connected.clone(),
            },
            events: events_rx,
            stash: VecDeque::new(),
        };
        let endpoint = ConnectionEndpoint {
            commands: commands_rx,
            events: events_tx,
            connected,
        };
        (connection, endpoint)
    }

    /// Drive an async byte stream in a background task
    pub fn from_io<T>(io: T) -> Connection
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connection, endpoint) = Self::channel();
        let id = connection.id();
        tokio::spawn(drive_io(id, io, endpoint));
        connection
    }

    /// Two connections joined by an in-memory pipe
    pub fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(DUPLEX_CAPACITY);
        (Self::from_io(a), Self::from_io(b))
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// A cloneable write handle
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Queue a write
    pub fn write(&self, data: Bytes) -> Result<(), SessionError> {
        self.handle.write(data)
    }

    /// Request an orderly close
    pub fn close(&self) {
        self.handle.close()
    }

    /// Whether the connection is still open
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Next event. Returns `None` once the connection is closed and every
    /// event has been consumed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if let Some(data) = self.stash.pop_front() {
            return Some(StreamEvent::Received(data));
        }
        self.events.recv().await
    }

    /// Next received chunk, skipping send completions
    pub async fn recv(&mut self) -> Result<Bytes, SessionError> {
        loop {
            match self.next_event().await {
                Some(StreamEvent::Received(data)) => return Ok(data),
                Some(StreamEvent::Sent) => continue,
                Some(StreamEvent::Closed { error }) => return Err(SessionError::Closed(error)),
                None => return Err(SessionError::Closed(None)),
            }
        }
    }

    /// Push bytes back so the next event delivers them again
    pub fn unread(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.stash.push_front(data);
        }
    }

    /// Split into a write handle and a stream of events
    pub fn into_event_stream(self) -> (ConnectionHandle, EventStream) {
        let stashed = tokio_stream::iter(self.stash.into_iter().map(StreamEvent::Received));
        let stream = stashed.chain(UnboundedReceiverStream::new(self.events));
        (self.handle, Box::pin(stream))
    }
}

async fn drive_io<T>(id: ConnectionId, io: T, mut endpoint: ConnectionEndpoint)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(io);
    let (queue, pending) = mpsc::unbounded_channel();
    let mut writing = tokio::spawn(write_queued(id, writer, pending, endpoint.events.clone()));
    let mut queue = Some(queue);
    let mut writer_finished = false;
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

    // Reading never waits on a blocked write; the writer task owns the write half
    let error = loop {
        buf.reserve(READ_CHUNK_SIZE);
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break None,
                Ok(n) => {
                    trace!("{} read {} bytes", id, n);
                    let chunk = buf.split().freeze();
                    if endpoint.events.send(StreamEvent::Received(chunk)).is_err() {
                        break None;
                    }
                }
                Err(e) => break Some(e.to_string()),
            },
            command = endpoint.commands.recv(), if queue.is_some() => match command {
                Some(Command::Write(data)) => {
                    if let Some(queue) = &queue {
                        let _ = queue.send(data);
                    }
                }
                // Dropping the queue lets the writer flush and shut down
                Some(Command::Close) | None => queue = None,
            },
            written = &mut writing => {
                writer_finished = true;
                break match written {
                    Ok(result) => result.err().map(|e| e.to_string()),
                    Err(e) => Some(e.to_string()),
                };
            }
        }
    };

    // No Sent event may follow the final Closed
    if !writer_finished {
        writing.abort();
        let _ = writing.await;
    }
    debug!("{} closed{}", id, error.as_ref().map(|e| format!(": {}", e)).unwrap_or_default());
    endpoint.finish(error);
}

/// Write queued chunks in order until the queue is dropped, then shut down
async fn write_queued<W>(
    id: ConnectionId,
    mut writer: W,
    mut pending: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<StreamEvent>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = pending.recv().await {
        writer.write_all(&data).await?;
        trace!("{} wrote {} bytes", id, data.len());
        let _ = events.send(StreamEvent::Sent);
    }
    let _ = writer.shutdown().await;
    Ok(())
}
