//! Multi-hop connection establishment.
//!
//! A routed connection follows a hop tree. Every peer on the tree opens a
//! direct connection to each of its children, sends a routed link handshake
//! followed by the child's subtree, and then waits for one confirmation per
//! destination in that subtree. Relays pass those confirmations upstream
//! before joining their incoming and outgoing streams, so confirmations
//! never interleave with relayed bytes. Once the source holds every
//! confirmation it sends its own, which travels down the whole tree; each
//! destination checks it before handing the connection to its application.
//!
//! Any failure closes every connection opened for the attempt. Neighboring
//! hops see the close and fail in turn, so the whole tree unwinds.

use crate::RouterError;
use futures::future::join_all;
use mesh_session::{
    recv_confirmation, send_confirmation, send_link_handshake, send_packet, Address, Connection,
    ForkingConnection, MulticastConnection, SessionError,
};
use mesh_wire::{LinkHandshake, LinkPurpose, MulticastHandshake, Packet, PeerId, Tree};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One direct hop: a child of the local peer in the hop tree
#[derive(Debug, Clone)]
pub(crate) struct Hop {
    pub(crate) subtree: Tree<PeerId>,
    pub(crate) address: Arc<dyn Address>,
}

/// Parameters shared by every hop of one routed connection
#[derive(Debug, Clone)]
pub(crate) struct Establishment {
    pub(crate) local_id: PeerId,
    pub(crate) local_name: String,
    pub(crate) source: PeerId,
    pub(crate) destinations: BTreeSet<PeerId>,
    pub(crate) handshake_timeout: Duration,
    pub(crate) confirmation_timeout: Duration,
}

/// A child connection whose subtree has confirmed
struct ConfirmedHop {
    connection: Connection,
    confirmed: Vec<PeerId>,
}

impl Establishment {
    fn is_destination(&self) -> bool {
        self.destinations.contains(&self.local_id)
    }

    /// Establish from the source. Resolves once every destination confirmed.
    pub(crate) async fn originate(&self, hops: Vec<Hop>) -> Result<Connection, RouterError> {
        let children = self.open_hops(hops).await?;
        let mut connections: Vec<Connection> =
            children.into_iter().map(|hop| hop.connection).collect();

        let mut failure = None;
        for connection in connections.iter_mut() {
            if let Err(e) = send_confirmation(connection, self.local_id, self.handshake_timeout).await {
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            close_all(&connections);
            return Err(e.into());
        }

        info!(
            "Routed connection to {} destinations over {} hops established",
            self.destinations.len(),
            connections.len()
        );
        Ok(join(connections))
    }

    /// Continue an establishment that arrived on `incoming`.
    ///
    /// Returns the connection for the local application if this peer is a
    /// destination, `None` if it only relays.
    pub(crate) async fn relay(
        &self,
        mut incoming: Connection,
        hops: Vec<Hop>,
    ) -> Result<Option<Connection>, RouterError> {
        if hops.is_empty() {
            if !self.is_destination() {
                incoming.close();
                return Err(RouterError::NotADestination(self.source));
            }
            return match self.confirm_leaf(&mut incoming).await {
                Ok(()) => Ok(Some(incoming)),
                Err(e) => {
                    incoming.close();
                    Err(e)
                }
            };
        }

        let children = match self.open_hops(hops).await {
            Ok(children) => children,
            Err(e) => {
                incoming.close();
                return Err(e);
            }
        };

        let mut upstream: Vec<PeerId> = children
            .iter()
            .flat_map(|hop| hop.confirmed.iter().copied())
            .collect();
        if self.is_destination() {
            upstream.push(self.local_id);
        }
        let connections: Vec<Connection> = children.into_iter().map(|hop| hop.connection).collect();
        for sender in upstream {
            if let Err(e) = send_confirmation(&mut incoming, sender, self.handshake_timeout).await {
                close_all(&connections);
                incoming.close();
                return Err(e.into());
            }
        }

        let source = self.source;
        let outgoing = join(connections);
        let mut local = ForkingConnection::spawn(incoming, outgoing, move || {
            debug!("Relay of routed connection from {} closed", source);
        });

        if !self.is_destination() {
            debug!("Relaying routed connection from {}", source);
            return Ok(None);
        }
        if let Err(e) = self.expect_source(&mut local).await {
            local.close();
            return Err(e);
        }
        Ok(Some(local))
    }

    async fn confirm_leaf(&self, incoming: &mut Connection) -> Result<(), RouterError> {
        send_confirmation(incoming, self.local_id, self.handshake_timeout).await?;
        self.expect_source(incoming).await
    }

    async fn expect_source(&self, connection: &mut Connection) -> Result<(), RouterError> {
        let sender = recv_confirmation(connection, self.confirmation_timeout).await?;
        if sender != self.source {
            return Err(RouterError::ConfirmationMismatch(sender));
        }
        Ok(())
    }

    /// Open every hop concurrently; all or nothing
    async fn open_hops(&self, hops: Vec<Hop>) -> Result<Vec<ConfirmedHop>, RouterError> {
        let results = join_all(hops.iter().map(|hop| self.open_hop(hop))).await;

        let mut opened = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(hop) => opened.push(hop),
                Err(e) if failure.is_none() => failure = Some(e),
                Err(e) => debug!("Additional hop failure: {}", e),
            }
        }
        match failure {
            None => Ok(opened),
            Some(e) => {
                for hop in &opened {
                    hop.connection.close();
                }
                Err(e)
            }
        }
    }

    async fn open_hop(&self, hop: &Hop) -> Result<ConfirmedHop, RouterError> {
        let child = hop.subtree.value;
        let mut connection = hop.address.open().await?;
        match self.handshake_hop(&mut connection, hop).await {
            Ok(confirmed) => {
                debug!("Hop {} confirmed {} destinations", child, confirmed.len());
                Ok(ConfirmedHop {
                    connection,
                    confirmed,
                })
            }
            Err(e) => {
                warn!("Hop to {} failed: {}", child, e);
                connection.close();
                Err(e)
            }
        }
    }

    async fn handshake_hop(
        &self,
        connection: &mut Connection,
        hop: &Hop,
    ) -> Result<Vec<PeerId>, RouterError> {
        let link = LinkHandshake::new(self.local_id, LinkPurpose::Routed, self.local_name.clone());
        send_link_handshake(connection, link, self.handshake_timeout).await?;

        let plan = MulticastHandshake::new(
            self.source,
            self.destinations.iter().copied().collect(),
            hop.subtree.clone(),
        )
        .map_err(SessionError::from)?;
        send_packet(connection, &Packet::MulticastHandshake(plan), self.handshake_timeout).await?;

        let mut pending: BTreeSet<PeerId> = self
            .destinations
            .iter()
            .filter(|destination| hop.subtree.contains(*destination))
            .copied()
            .collect();
        let mut confirmed = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let sender = recv_confirmation(connection, self.confirmation_timeout).await?;
            if !pending.remove(&sender) {
                return Err(RouterError::ConfirmationMismatch(sender));
            }
            confirmed.push(sender);
        }
        Ok(confirmed)
    }
}

fn join(mut connections: Vec<Connection>) -> Connection {
    if connections.len() == 1 {
        if let Some(connection) = connections.pop() {
            return connection;
        }
    }
    MulticastConnection::spawn(connections)
}

fn close_all(connections: &[Connection]) {
    for connection in connections {
        connection.close();
    }
}
