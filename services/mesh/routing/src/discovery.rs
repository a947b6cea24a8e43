//! Discovery backend interfaces.
//!
//! A discovery module pairs an [`Advertiser`], which makes the local peer
//! reachable and hands over accepted connections, with a [`Browser`], which
//! reports addresses of remote peers. Backends report back through delegate
//! objects; the router registers one delegate per role and module.
//!
//! Start and stop calls only request a transition. A backend confirms it
//! later through `did_start` / `did_stop`, which is what the router's
//! supervision waits for.

use mesh_session::{Address, Connection};
use mesh_wire::PeerId;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Identifier of a registered discovery module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    /// Wrap a raw identifier
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module-{}", self.0)
    }
}

/// The two supervised roles of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Advertising the local peer
    Advertiser,
    /// Browsing for remote peers
    Browser,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Advertiser => write!(f, "advertiser"),
            Role::Browser => write!(f, "browser"),
        }
    }
}

/// Receives advertiser notifications
pub trait AdvertiserDelegate: Send + Sync {
    /// Advertising is active
    fn did_start(&self);
    /// Advertising has ended
    fn did_stop(&self);
    /// A remote peer opened a connection to us
    fn handle_incoming_connection(&self, connection: Connection);
}

/// Makes the local peer discoverable and accepts connections
pub trait Advertiser: Send + Sync {
    /// Request advertising under the given identifier
    fn start_advertising(&self, local_id: PeerId, delegate: Arc<dyn AdvertiserDelegate>);
    /// Request advertising to end
    fn stop_advertising(&self);
}

/// Receives browser notifications
pub trait BrowserDelegate: Send + Sync {
    /// Browsing is active
    fn did_start(&self);
    /// Browsing has ended
    fn did_stop(&self);
    /// An address of a remote peer appeared
    fn did_discover_address(&self, peer: PeerId, address: Arc<dyn Address>);
    /// An address, identified by its key, went away
    fn did_remove_address(&self, peer: PeerId, key: String);
}

/// Reports addresses of remote peers
pub trait Browser: Send + Sync {
    /// Request browsing
    fn start_browsing(&self, delegate: Arc<dyn BrowserDelegate>);
    /// Request browsing to end
    fn stop_browsing(&self);
}

/// An advertiser/browser pair registered with the router as one unit
#[derive(Clone)]
pub struct DiscoveryModule {
    name: String,
    advertiser: Arc<dyn Advertiser>,
    browser: Arc<dyn Browser>,
}

impl fmt::Debug for DiscoveryModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryModule")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl DiscoveryModule {
    /// Bundle an advertiser and a browser
    pub fn new(
        name: impl Into<String>,
        advertiser: Arc<dyn Advertiser>,
        browser: Arc<dyn Browser>,
    ) -> Self {
        Self {
            name: name.into(),
            advertiser,
            browser,
        }
    }

    /// Module name, used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The advertising role
    pub fn advertiser(&self) -> Arc<dyn Advertiser> {
        self.advertiser.clone()
    }

    /// The browsing role
    pub fn browser(&self) -> Arc<dyn Browser> {
        self.browser.clone()
    }
}

/// Tracks which children of a composite have started
struct StartedChildren {
    total: usize,
    started: Mutex<BTreeSet<usize>>,
}

impl StartedChildren {
    fn new(total: usize) -> Self {
        Self {
            total,
            started: Mutex::new(BTreeSet::new()),
        }
    }

    /// Record a started child; true once every child runs
    fn start(&self, index: usize) -> bool {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        started.insert(index);
        started.len() == self.total
    }

    /// Record a stopped child; true once no child runs
    fn stop(&self, index: usize) -> bool {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        started.remove(&index);
        started.is_empty()
    }
}

/// Several advertisers acting as one.
///
/// Reports `did_start` once every child has started and `did_stop` once every
/// child has stopped. Incoming connections from any child are passed on.
pub struct CompositeAdvertiser {
    children: Vec<Arc<dyn Advertiser>>,
}

impl CompositeAdvertiser {
    /// Combine advertisers
    pub fn new(children: Vec<Arc<dyn Advertiser>>) -> Self {
        Self { children }
    }
}

struct CompositeAdvertiserChild {
    index: usize,
    state: Arc<StartedChildren>,
    delegate: Arc<dyn AdvertiserDelegate>,
}

impl AdvertiserDelegate for CompositeAdvertiserChild {
    fn did_start(&self) {
        if self.state.start(self.index) {
            self.delegate.did_start();
        }
    }

    fn did_stop(&self) {
        if self.state.stop(self.index) {
            self.delegate.did_stop();
        }
    }

    fn handle_incoming_connection(&self, connection: Connection) {
        self.delegate.handle_incoming_connection(connection);
    }
}

impl Advertiser for CompositeAdvertiser {
    fn start_advertising(&self, local_id: PeerId, delegate: Arc<dyn AdvertiserDelegate>) {
        debug!("Starting {} advertisers", self.children.len());
        let state = Arc::new(StartedChildren::new(self.children.len()));
        for (index, child) in self.children.iter().enumerate() {
            child.start_advertising(
                local_id,
                Arc::new(CompositeAdvertiserChild {
                    index,
                    state: state.clone(),
                    delegate: delegate.clone(),
                }),
            );
        }
    }

    fn stop_advertising(&self) {
        for child in &self.children {
            child.stop_advertising();
        }
    }
}

/// Several browsers acting as one.
///
/// Start and stop are aggregated like [`CompositeAdvertiser`]; address events
/// from any child are passed on.
pub struct CompositeBrowser {
    children: Vec<Arc<dyn Browser>>,
}

impl CompositeBrowser {
    /// Combine browsers
    pub fn new(children: Vec<Arc<dyn Browser>>) -> Self {
        Self { children }
    }
}

struct CompositeBrowserChild {
    index: usize,
    state: Arc<StartedChildren>,
    delegate: Arc<dyn BrowserDelegate>,
}

impl BrowserDelegate for CompositeBrowserChild {
    fn did_start(&self) {
        if self.state.start(self.index) {
            self.delegate.did_start();
        }
    }

    fn did_stop(&self) {
        if self.state.stop(self.index) {
            self.delegate.did_stop();
        }
    }

    fn did_discover_address(&self, peer: PeerId, address: Arc<dyn Address>) {
        self.delegate.did_discover_address(peer, address);
    }

    fn did_remove_address(&self, peer: PeerId, key: String) {
        self.delegate.did_remove_address(peer, key);
    }
}

impl Browser for CompositeBrowser {
    fn start_browsing(&self, delegate: Arc<dyn BrowserDelegate>) {
        debug!("Starting {} browsers", self.children.len());
        let state = Arc::new(StartedChildren::new(self.children.len()));
        for (index, child) in self.children.iter().enumerate() {
            child.start_browsing(Arc::new(CompositeBrowserChild {
                index,
                state: state.clone(),
                delegate: delegate.clone(),
            }));
        }
    }

    fn stop_browsing(&self) {
        for child in &self.children {
            child.stop_browsing();
        }
    }
}
