//! Node facade wiring listener, entry nodes and relay service together.
//!
//! ```text
//! Listener ──Connection──► Relay::dispatch ──► RelayedConnection ──► NodeEvent::Connection
//!    │                                                  ▲
//!    └──Listening──► Relay::set_used_relays             │
//!                                     Node::connect ────┘
//! ```
//!
//! Peers are dialed over plain TCP using the [`AddressBook`]. A relay must
//! know the direct address of every destination it forwards to, so hosts
//! feed the book from their own peer discovery via [`Node::add_peer`].

use crate::error::{Result, TransportError};
use crate::listener::{Listener, ListenerConfig, ListenerEvent};
use crate::tcp::{AddressBook, PlainUpgrader, TcpDialer};
use relaymesh_core::{Address, Announcer, Dialer, PeerId, Upgrader, UsableAddressFilter};
use relaymesh_discovery::{EntryNodeConfig, EntryNodes, PublicNodeEvent};
use relaymesh_relay::{Relay, RelayConfig, RelayedConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Settings of all node components
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Listener settings
    pub listener: ListenerConfig,
    /// Entry node settings
    pub entry: EntryNodeConfig,
    /// Relay service settings
    pub relay: RelayConfig,
}

/// Events of a [`Node`]
#[derive(Debug)]
pub enum NodeEvent {
    /// Listening started or the advertised addresses changed
    Listening,
    /// A relayed connection from another node
    Connection(RelayedConnection),
    /// The node closed
    Close,
}

/// A relaymesh node
pub struct Node {
    local_id: PeerId,
    book: AddressBook,
    entry_nodes: EntryNodes,
    relay: Relay,
    listener: Listener,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local_id", &self.local_id)
            .field("listener", &self.listener)
            .finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Node {
    /// Create node `local_id`. Must be called within a tokio runtime.
    ///
    /// With an `announcer` the node announces itself as relay whenever an
    /// entry node manager probes it.
    #[must_use]
    pub fn new(
        local_id: PeerId,
        config: NodeConfig,
        announcer: Option<Arc<dyn Announcer>>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let book = AddressBook::new();
        let upgrader: Arc<dyn Upgrader> = Arc::new(PlainUpgrader::new(local_id));
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(upgrader.clone(), book.clone()));

        let entry_nodes = EntryNodes::new(
            local_id,
            dialer.clone(),
            Arc::new(UsableAddressFilter),
            config.entry,
        );
        let (relay, incoming) = Relay::new(local_id, dialer, announcer, config.relay);
        let (listener, listener_events) = Listener::new(
            local_id,
            upgrader,
            Some(entry_nodes.clone()),
            config.listener,
        );

        let (events, events_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(route_listener_events(
                listener_events,
                relay.clone(),
                entry_nodes.clone(),
                events.clone(),
            )),
            tokio::spawn(forward_incoming(incoming, events)),
        ];

        let node = Self {
            local_id,
            book,
            entry_nodes,
            relay,
            listener,
            tasks,
        };
        (node, events_rx)
    }

    /// Identity of this node
    #[must_use]
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Addresses used to dial peers directly
    #[must_use]
    pub fn address_book(&self) -> &AddressBook {
        &self.book
    }

    /// Remember direct addresses of `peer`
    pub fn add_peer(&self, peer: PeerId, addrs: impl IntoIterator<Item = Address>) {
        self.book.add(peer, addrs);
    }

    /// The entry node manager
    #[must_use]
    pub fn entry_nodes(&self) -> &EntryNodes {
        &self.entry_nodes
    }

    /// The relay service
    #[must_use]
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// The listener
    #[must_use]
    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Start the entry node manager and listen on `addr`.
    ///
    /// `feed` delivers public nodes coming and going, typically from the
    /// host's DHT.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn listen(
        &self,
        addr: SocketAddr,
        feed: Option<mpsc::Receiver<PublicNodeEvent>>,
    ) -> Result<()> {
        for seed in self.entry_nodes.unchecked_entry_nodes().await {
            self.book.add(seed.id, seed.addresses);
        }
        self.entry_nodes.start(feed).await;
        self.listener.listen(addr).await
    }

    /// Advertised addresses
    pub async fn get_addrs(&self) -> Vec<Address> {
        self.listener.get_addrs().await
    }

    /// Open a relayed connection to the destination of circuit address
    /// `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is not a circuit address or the circuit
    /// cannot be established.
    pub async fn connect(&self, addr: &Address) -> Result<RelayedConnection> {
        match (addr.relay(), addr.peer_id()) {
            (Some(relay), Some(destination)) => Ok(self.relay.connect(&relay, &destination).await?),
            _ => Err(TransportError::Core(relaymesh_core::Error::InvalidAddress {
                addr: addr.to_string(),
                reason: "not a circuit address".into(),
            })),
        }
    }

    /// Stop the entry node manager and close the listener
    pub async fn close(&self) {
        self.entry_nodes.stop().await;
        self.listener.close().await;
    }
}

async fn route_listener_events(
    mut listener_events: mpsc::UnboundedReceiver<ListenerEvent>,
    relay: Relay,
    entry_nodes: EntryNodes,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    while let Some(event) = listener_events.recv().await {
        match event {
            ListenerEvent::Listening => {
                relay.set_used_relays(entry_nodes.used_relay_peer_ids().await);
                let _ = events.send(NodeEvent::Listening);
            }
            ListenerEvent::Connection(inbound) => {
                let relay = relay.clone();
                tokio::spawn(async move { relay.dispatch(inbound).await });
            }
            ListenerEvent::Close => {
                let _ = events.send(NodeEvent::Close);
            }
        }
    }
}

async fn forward_incoming(
    mut incoming: mpsc::UnboundedReceiver<RelayedConnection>,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    while let Some(connection) = incoming.recv().await {
        tracing::debug!(
            "incoming relayed connection from {} via {}",
            connection.counterparty().short(),
            connection.relay_handle().relay().short()
        );
        if events.send(NodeEvent::Connection(connection)).is_err() {
            break;
        }
    }
}
