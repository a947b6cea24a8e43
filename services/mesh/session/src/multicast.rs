//! Fan-out connections over several subconnections.

use crate::connection::{Command, ConnectionEndpoint};
use crate::{Connection, StreamEvent};
use tokio_stream::{StreamExt, StreamMap};
use tracing::debug;

/// One logical connection over several subconnections.
///
/// Every write is sent to all subconnections, and a `Sent` event is reported
/// once every subconnection has completed that write. Data received on any
/// subconnection is delivered as is. The connection counts as connected only
/// while all subconnections are; the first close closes every subconnection.
pub struct MulticastConnection;

impl MulticastConnection {
    /// Start the fan-out and return the logical connection
    pub fn spawn(subconnections: Vec<Connection>) -> Connection {
        let (connection, endpoint) = Connection::channel();
        debug!(
            "Multicast {} over {} subconnections",
            connection.id(),
            subconnections.len()
        );
        tokio::spawn(run(subconnections, endpoint));
        connection
    }
}

async fn run(subconnections: Vec<Connection>, mut endpoint: ConnectionEndpoint) {
    let mut handles = Vec::with_capacity(subconnections.len());
    let mut events = StreamMap::new();
    for (index, subconnection) in subconnections.into_iter().enumerate() {
        let (handle, stream) = subconnection.into_event_stream();
        handles.push(handle);
        events.insert(index, stream);
    }

    // Completed writes per subconnection, and how many were reported
    let mut sent = vec![0u64; handles.len()];
    let mut reported = 0u64;

    let error = loop {
        tokio::select! {
            Some((index, event)) = events.next() => match event {
                StreamEvent::Received(data) => {
                    let _ = endpoint.events.send(StreamEvent::Received(data));
                }
                StreamEvent::Sent => {
                    sent[index] += 1;
                    let completed = sent.iter().copied().min().unwrap_or(0);
                    while reported < completed {
                        reported += 1;
                        let _ = endpoint.events.send(StreamEvent::Sent);
                    }
                }
                StreamEvent::Closed { error } => break error,
            },
            command = endpoint.commands.recv() => match command {
                Some(Command::Write(data)) => {
                    for handle in &handles {
                        let _ = handle.write(data.clone());
                    }
                }
                Some(Command::Close) | None => break None,
            },
            else => break None,
        }
    };

    for handle in &handles {
        handle.close();
    }
    debug!("Multicast over {} subconnections closed", handles.len());
    endpoint.finish(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_write_reaches_every_subconnection() {
        let (a, mut far_a) = Connection::pair();
        let (b, mut far_b) = Connection::pair();
        let mut multicast = MulticastConnection::spawn(vec![a, b]);
        assert!(multicast.is_connected());

        multicast.write(Bytes::from_static(b"all")).unwrap();
        assert_eq!(multicast.next_event().await, Some(StreamEvent::Sent));
        assert_eq!(far_a.recv().await.unwrap(), Bytes::from_static(b"all"));
        assert_eq!(far_b.recv().await.unwrap(), Bytes::from_static(b"all"));
    }

    #[tokio::test]
    async fn test_sent_counts_down_per_write() {
        let (a, _far_a) = Connection::pair();
        let (b, _far_b) = Connection::pair();
        let (c, _far_c) = Connection::pair();
        let mut multicast = MulticastConnection::spawn(vec![a, b, c]);

        for _ in 0..3 {
            multicast.write(Bytes::from_static(b"x")).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(multicast.next_event().await, Some(StreamEvent::Sent));
        }
    }

    #[tokio::test]
    async fn test_data_from_any_subconnection() {
        let (a, far_a) = Connection::pair();
        let (b, far_b) = Connection::pair();
        let mut multicast = MulticastConnection::spawn(vec![a, b]);

        far_b.write(Bytes::from_static(b"from b")).unwrap();
        assert_eq!(multicast.recv().await.unwrap(), Bytes::from_static(b"from b"));
        far_a.write(Bytes::from_static(b"from a")).unwrap();
        assert_eq!(multicast.recv().await.unwrap(), Bytes::from_static(b"from a"));
    }

    #[tokio::test]
    async fn test_any_close_closes_all() {
        let (a, far_a) = Connection::pair();
        let (b, mut far_b) = Connection::pair();
        let mut multicast = MulticastConnection::spawn(vec![a, b]);

        far_a.close();
        assert_eq!(
            multicast.next_event().await,
            Some(StreamEvent::Closed { error: None })
        );
        assert!(!multicast.is_connected());
        assert!(far_b.recv().await.is_err());
    }
}
