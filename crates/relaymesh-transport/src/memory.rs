//! In-process network.
//!
//! Nodes register under their identity and receive every stream opened to
//! them as an [`InboundStream`]. Links can be cut to simulate unreachable
//! peers. Used by tests and simulations; nothing touches the OS network.

use async_trait::async_trait;
use relaymesh_core::{Address, Announcer, Dialer, Error, InboundStream, PeerId, Protocol, Result, Stream};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, mpsc::UnboundedSender<InboundStream>>,
    cut: HashSet<(PeerId, PeerId)>,
    providers: HashMap<[u8; 32], HashSet<PeerId>>,
}

/// Shared in-process network. Cloning yields another handle.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.read().nodes.len())
            .finish()
    }
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, NetworkState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, NetworkState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `peer`. Streams opened to it arrive on the returned channel.
    /// Registering again replaces the previous registration.
    pub fn register(&self, peer: PeerId) -> mpsc::UnboundedReceiver<InboundStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().nodes.insert(peer, tx);
        rx
    }

    /// Detach `peer`
    pub fn unregister(&self, peer: &PeerId) {
        self.write().nodes.remove(peer);
    }

    /// Whether `peer` is attached
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.read().nodes.contains_key(peer)
    }

    /// Make `a` and `b` unreachable for each other
    pub fn cut(&self, a: PeerId, b: PeerId) {
        let mut state = self.write();
        state.cut.insert((a, b));
        state.cut.insert((b, a));
    }

    /// Undo [`MemoryNetwork::cut`]
    pub fn heal(&self, a: PeerId, b: PeerId) {
        let mut state = self.write();
        state.cut.remove(&(a, b));
        state.cut.remove(&(b, a));
    }

    /// Dialer acting as `local`
    #[must_use]
    pub fn dialer(&self, local: PeerId) -> MemoryDialer {
        MemoryDialer {
            network: self.clone(),
            local,
        }
    }

    /// Announcer acting as `local`
    #[must_use]
    pub fn announcer(&self, local: PeerId) -> MemoryAnnouncer {
        MemoryAnnouncer {
            network: self.clone(),
            local,
        }
    }

    /// Nodes that announced `key`
    #[must_use]
    pub fn providers(&self, key: &[u8; 32]) -> Vec<PeerId> {
        self.read()
            .providers
            .get(key)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    fn open(&self, from: PeerId, to: &PeerId, protocol: Protocol) -> Result<Stream> {
        let state = self.read();
        if state.cut.contains(&(from, *to)) {
            return Err(Error::dial(format!("link to {} is cut", to.short())));
        }
        let node = state
            .nodes
            .get(to)
            .ok_or_else(|| Error::dial(format!("{} is not on the network", to.short())))?;

        let (local, remote) = Stream::pair();
        node.send(InboundStream {
            remote_peer: from,
            protocol,
            stream: remote,
        })
        .map_err(|_| Error::dial(format!("{} stopped accepting", to.short())))?;
        Ok(local)
    }
}

/// [`Dialer`] over a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    network: MemoryNetwork,
    local: PeerId,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, addr: &Address, protocol: Protocol) -> Result<Stream> {
        if addr.is_circuit() {
            return Err(Error::dial(format!(
                "{} must be dialed through the relay service",
                addr
            )));
        }
        let peer = addr
            .peer_id()
            .ok_or_else(|| Error::dial(format!("{} does not name a peer", addr)))?;
        self.network.open(self.local, &peer, protocol)
    }

    async fn dial_peer(&self, peer: &PeerId, protocol: Protocol) -> Result<Stream> {
        self.network.open(self.local, peer, protocol)
    }
}

/// [`Announcer`] recording providers in a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryAnnouncer {
    network: MemoryNetwork,
    local: PeerId,
}

#[async_trait]
impl Announcer for MemoryAnnouncer {
    async fn announce(&self, key: [u8; 32]) -> Result<()> {
        self.network
            .write()
            .providers
            .entry(key)
            .or_default()
            .insert(self.local);
        Ok(())
    }
}
