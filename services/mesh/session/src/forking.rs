//! Relay connections that mirror traffic between two streams.

use crate::connection::{Command, ConnectionEndpoint};
use crate::{Connection, StreamEvent};
use std::collections::VecDeque;
use tokio_stream::StreamExt;
use tracing::debug;

/// Joins an incoming and an outgoing connection at a relay.
///
/// Bytes received on `incoming` are written to `outgoing` and also delivered
/// to the returned local view. Bytes received on `outgoing` are written to
/// `incoming`. Writes on the local view travel towards the source, i.e. to
/// `incoming`. Closing either side, or closing the local view, closes both
/// streams; `on_close` runs exactly once afterwards. Dropping the local view
/// without closing it only detaches the local reader.
pub struct ForkingConnection;

impl ForkingConnection {
    /// Start forwarding and return the local view
    pub fn spawn<F>(incoming: Connection, outgoing: Connection, on_close: F) -> Connection
    where
        F: FnOnce() + Send + 'static,
    {
        let (local, endpoint) = Connection::channel();
        debug!(
            "Forking {} <-> {} (local view {})",
            incoming.id(),
            outgoing.id(),
            local.id()
        );
        tokio::spawn(run(incoming, outgoing, endpoint, on_close));
        local
    }
}

async fn run<F>(incoming: Connection, outgoing: Connection, mut local: ConnectionEndpoint, on_close: F)
where
    F: FnOnce() + Send + 'static,
{
    let (incoming_handle, mut incoming_events) = incoming.into_event_stream();
    let (outgoing_handle, mut outgoing_events) = outgoing.into_event_stream();

    // Origin of every write queued on `incoming`, true for local writes
    let mut incoming_writes: VecDeque<bool> = VecDeque::new();
    let mut local_attached = true;

    let error = loop {
        tokio::select! {
            event = incoming_events.next() => match event {
                Some(StreamEvent::Received(data)) => {
                    if local_attached && local.events.send(StreamEvent::Received(data.clone())).is_err() {
                        local_attached = false;
                    }
                    let _ = outgoing_handle.write(data);
                }
                Some(StreamEvent::Sent) => {
                    if incoming_writes.pop_front() == Some(true) && local_attached {
                        let _ = local.events.send(StreamEvent::Sent);
                    }
                }
                Some(StreamEvent::Closed { error }) => break error,
                None => break None,
            },
            event = outgoing_events.next() => match event {
                Some(StreamEvent::Received(data)) => {
                    if incoming_handle.write(data).is_ok() {
                        incoming_writes.push_back(false);
                    }
                }
                Some(StreamEvent::Sent) => {}
                Some(StreamEvent::Closed { error }) => break error,
                None => break None,
            },
            command = local.commands.recv(), if local_attached => match command {
                Some(Command::Write(data)) => {
                    if incoming_handle.write(data).is_ok() {
                        incoming_writes.push_back(true);
                    }
                }
                Some(Command::Close) => break None,
                None => local_attached = false,
            },
        }
    };

    incoming_handle.close();
    outgoing_handle.close();
    local.finish(error);
    debug!("Fork {} <-> {} closed", incoming_handle.id(), outgoing_handle.id());
    on_close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Relay {
        source: Connection,
        destination: Connection,
        local: Connection,
        closes: Arc<AtomicUsize>,
    }

    fn relay() -> Relay {
        let (source, relay_in) = Connection::pair();
        let (relay_out, destination) = Connection::pair();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let local = ForkingConnection::spawn(relay_in, relay_out, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        Relay {
            source,
            destination,
            local,
            closes,
        }
    }

    #[tokio::test]
    async fn test_traffic_is_mirrored() {
        let mut relay = relay();

        relay.source.write(Bytes::from_static(b"down")).unwrap();
        assert_eq!(relay.destination.recv().await.unwrap(), Bytes::from_static(b"down"));
        assert_eq!(relay.local.recv().await.unwrap(), Bytes::from_static(b"down"));

        relay.destination.write(Bytes::from_static(b"up")).unwrap();
        assert_eq!(relay.source.recv().await.unwrap(), Bytes::from_static(b"up"));

        relay.local.write(Bytes::from_static(b"from relay")).unwrap();
        assert_eq!(relay.local.next_event().await, Some(StreamEvent::Sent));
        assert_eq!(relay.source.recv().await.unwrap(), Bytes::from_static(b"from relay"));
    }

    #[tokio::test]
    async fn test_close_propagates_once() {
        let mut relay = relay();
        relay.destination.close();

        assert!(relay.source.recv().await.is_err());
        assert_eq!(
            relay.local.next_event().await,
            Some(StreamEvent::Closed { error: None })
        );
        assert_eq!(relay.local.next_event().await, None);
        assert_eq!(relay.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_close_closes_both() {
        let mut relay = relay();
        relay.local.close();

        assert!(relay.source.recv().await.is_err());
        assert!(relay.destination.recv().await.is_err());
        // The local view ends after the close callback has run
        while relay.local.next_event().await.is_some() {}
        assert_eq!(relay.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_local_view_keeps_forwarding() {
        let Relay {
            mut source,
            mut destination,
            local,
            ..
        } = relay();
        drop(local);

        source.write(Bytes::from_static(b"still here")).unwrap();
        assert_eq!(destination.recv().await.unwrap(), Bytes::from_static(b"still here"));
        destination.write(Bytes::from_static(b"and back")).unwrap();
        assert_eq!(source.recv().await.unwrap(), Bytes::from_static(b"and back"));
    }
}
