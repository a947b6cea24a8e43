//! Routing core for mesh peers.
//!
//! The [`Router`] keeps a registry of known peers, maintains direct routing
//! connections to neighbors, floods link state over them and establishes
//! multi-hop connections along the hop tree of the routing table. Discovery
//! backends plug in as [`DiscoveryModule`]s and are started and stopped
//! under [`Supervisor`] control.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod node;
pub mod router;
pub mod supervision;

mod establish;
#[cfg(test)]
mod test_support;

pub use config::{BackoffConfig, RouterConfig};
pub use discovery::{
    Advertiser, AdvertiserDelegate, Browser, BrowserDelegate, CompositeAdvertiser,
    CompositeBrowser, DiscoveryModule, ModuleId, Role,
};
pub use error::RouterError;
pub use node::{Node, NodeAddress, PeerInfo};
pub use router::{Router, RouterEvent, RouterHandle};
pub use supervision::{Hook, Operation, Phase, Supervisor};
