//! Entry node management.
//!
//! Nodes that cannot be reached directly advertise relay circuit addresses
//! through up to [`MAX_RELAYS_PER_NODE`] entry nodes. This module keeps track
//! of candidate entry nodes, measures their latency, picks the best ones and
//! keeps connections to them open.
//!
//! ```text
//!  discovery feed ──► on_new_relay ──► unchecked ─┐
//!                                                  ├─► update_public_nodes ─► used (≤ 5)
//!                     available (by latency) ──────┘        │
//!                                                           └─► RelayChanged
//! ```
//!
//! A probe dials the can-relay protocol and waits for the answer `OK`. The
//! probe stream of a used relay is kept open; when it breaks, the manager
//! reconnects with exponential backoff.

use futures::StreamExt;
use relaymesh_core::{Address, AddressFilter, Dialer, PeerId, Protocol, Stream};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

/// Maximum number of entry nodes used at the same time
pub const MAX_RELAYS_PER_NODE: usize = 5;

/// Maximum number of concurrent probes
pub const ENTRY_NODES_MAX_PARALLEL_DIALS: usize = 14;

/// Timeout for contacting an entry node
pub const ENTRY_NODE_CONTACT_TIMEOUT: Duration = Duration::from_secs(3);

/// First reconnect delay after an entry node dropped
pub const DEFAULT_ENTRY_NODE_RECONNECT_BASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Growth factor of the reconnect delay
pub const DEFAULT_ENTRY_NODE_RECONNECT_BACKOFF: u32 = 2;

/// Interval at which used relays are contacted again so they renew their
/// DHT announcement
pub const DEFAULT_DHT_RENEWAL_INTERVAL: Duration = Duration::from_secs(120);

pub use relaymesh_core::CAN_RELAY_OK;

/// Latency recorded for unreachable nodes
const UNREACHABLE: i64 = -1;

/// Entry node manager settings
#[derive(Debug, Clone)]
pub struct EntryNodeConfig {
    /// Maximum number of used relays
    pub max_relays: usize,
    /// Maximum number of concurrent probes
    pub max_parallel_dials: usize,
    /// Timeout for dialing and awaiting the can-relay answer
    pub contact_timeout: Duration,
    /// First reconnect delay
    pub reconnect_base_timeout: Duration,
    /// Reconnect delay growth factor
    pub reconnect_backoff: u32,
    /// DHT renewal interval
    pub renewal_interval: Duration,
    /// Entry nodes known from configuration
    pub seed_nodes: Vec<PeerRecord>,
}

impl Default for EntryNodeConfig {
    fn default() -> Self {
        Self {
            max_relays: MAX_RELAYS_PER_NODE,
            max_parallel_dials: ENTRY_NODES_MAX_PARALLEL_DIALS,
            contact_timeout: ENTRY_NODE_CONTACT_TIMEOUT,
            reconnect_base_timeout: DEFAULT_ENTRY_NODE_RECONNECT_BASE_TIMEOUT,
            reconnect_backoff: DEFAULT_ENTRY_NODE_RECONNECT_BACKOFF,
            renewal_interval: DEFAULT_DHT_RENEWAL_INTERVAL,
            seed_nodes: Vec::new(),
        }
    }
}

/// A peer and its announced addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Peer identity
    pub id: PeerId,
    /// Announced addresses
    pub addresses: Vec<Address>,
}

/// A probed entry node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryNodeRecord {
    /// Node identity
    pub id: PeerId,
    /// Usable addresses, the first one is dialed
    pub addresses: Vec<Address>,
    /// Round trip of the last probe in ms, `-1` if it failed
    pub latency: i64,
}

/// An entry node currently used as relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedRelay {
    /// Relay identity
    pub relay: PeerId,
    /// Direct address the relay was reached at
    pub relay_address: Address,
    /// Circuit address under which this node is reachable through the relay
    pub circuit_address: Address,
}

/// Feed of public nodes coming and going
#[derive(Debug, Clone)]
pub enum PublicNodeEvent {
    /// A node announced itself as public
    Online(PeerRecord),
    /// A node is considered offline
    Offline(PeerId),
}

/// Emitted whenever the set of used relays changed
#[derive(Debug, Clone)]
pub struct RelayChanged {
    /// Circuit addresses after the change
    pub circuit_addresses: Vec<Address>,
}

struct ProbeResult {
    entry: EntryNodeRecord,
    stream: Option<Stream>,
}

#[derive(Default)]
struct EntryState {
    unchecked: Vec<PeerRecord>,
    available: Vec<EntryNodeRecord>,
    used: Vec<UsedRelay>,
    kept: HashMap<PeerId, JoinHandle<()>>,
}

struct EntryNodesInner {
    local_id: PeerId,
    dialer: Arc<dyn Dialer>,
    filter: Arc<dyn AddressFilter>,
    config: EntryNodeConfig,
    state: RwLock<EntryState>,
    update_lock: Mutex<()>,
    events: broadcast::Sender<RelayChanged>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    tag: String,
}

/// Entry node manager. Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct EntryNodes {
    inner: Arc<EntryNodesInner>,
}

impl EntryNodes {
    /// Create a manager for node `local_id`. Seed nodes from `config` are
    /// added to the unchecked list.
    #[must_use]
    pub fn new(
        local_id: PeerId,
        dialer: Arc<dyn Dialer>,
        filter: Arc<dyn AddressFilter>,
        config: EntryNodeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let seeds = config.seed_nodes.clone();

        let mut inner = EntryNodesInner {
            local_id,
            dialer,
            filter,
            config,
            state: RwLock::new(EntryState::default()),
            update_lock: Mutex::new(()),
            events,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            tag: relaymesh_core::instance_tag(),
        };

        let mut state = EntryState::default();
        for seed in seeds {
            inner.add_unchecked(&mut state, seed);
        }
        *inner.state.get_mut() = state;

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Subscribe to relay-changed notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayChanged> {
        self.inner.events.subscribe()
    }

    /// Whether [`EntryNodes::start`] was called and [`EntryNodes::stop`] was not
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Start DHT renewal and, if given, process the public node feed one
    /// event at a time.
    pub async fn start(&self, feed: Option<mpsc::Receiver<PublicNodeEvent>>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.inner.tasks.lock().await;

        if let Some(mut feed) = feed {
            let weak = Arc::downgrade(&self.inner);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = feed.recv().await {
                    let Some(nodes) = upgrade(&weak) else { break };
                    match event {
                        PublicNodeEvent::Online(peer) => {
                            tracing::debug!("[{}] peer online {}", nodes.inner.tag, peer.id.short());
                            nodes.on_new_relay(peer).await;
                        }
                        PublicNodeEvent::Offline(peer) => {
                            tracing::debug!("[{}] peer offline {}", nodes.inner.tag, peer.short());
                            nodes.on_remove_relay(&peer).await;
                        }
                    }
                }
            }));
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.renewal_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(nodes) = upgrade(&weak) else { break };
                nodes.renew_dht_entries().await;
            }
        }));
    }

    /// Stop background work and close kept entry connections.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            tracing::debug!("[{}] entry nodes stopped before start", self.inner.tag);
        }

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }

        let mut state = self.inner.state.write().await;
        for (_, watcher) in state.kept.drain() {
            watcher.abort();
        }
    }

    /// Circuit addresses of the used relays
    pub async fn used_relay_addresses(&self) -> Vec<Address> {
        let state = self.inner.state.read().await;
        state.used.iter().map(|u| u.circuit_address).collect()
    }

    /// Identities of the used relays
    pub async fn used_relay_peer_ids(&self) -> Vec<PeerId> {
        let state = self.inner.state.read().await;
        state.used.iter().map(|u| u.relay).collect()
    }

    /// Used relays
    pub async fn used_relays(&self) -> Vec<UsedRelay> {
        self.inner.state.read().await.used.clone()
    }

    /// Entry nodes that answered the last probe, by ascending latency
    pub async fn available_entry_nodes(&self) -> Vec<EntryNodeRecord> {
        self.inner.state.read().await.available.clone()
    }

    /// Entry nodes checked at the next rebuild
    pub async fn unchecked_entry_nodes(&self) -> Vec<PeerRecord> {
        self.inner.state.read().await.unchecked.clone()
    }

    /// Called once a new relay opportunity is known
    pub async fn on_new_relay(&self, peer: PeerRecord) {
        let used = {
            let mut state = self.inner.state.write().await;
            if !self.inner.add_unchecked(&mut state, peer) {
                return;
            }
            state.used.len()
        };

        // Once a relay goes offline it gets replaced, so there is no need to
        // check new nodes while enough relays are in use.
        if used < self.inner.config.max_relays {
            self.update_public_nodes().await;
        }
    }

    /// Called once a node is considered to be offline. Rebuilds the relay
    /// list only if the node was in use.
    pub async fn on_remove_relay(&self, peer: &PeerId) {
        let in_use = {
            let mut state = self.inner.state.write().await;
            state.available.retain(|entry| entry.id != *peer);
            state.used.iter().any(|u| u.relay == *peer)
        };

        if in_use {
            self.update_public_nodes().await;
        }
    }

    /// Unchecked nodes worth probing. Refreshes the addresses of nodes that
    /// are already available.
    fn filter_unchecked_nodes(&self, state: &mut EntryState) -> Vec<PeerRecord> {
        let mut to_check = Vec::new();
        let unchecked = std::mem::take(&mut state.unchecked);

        for node in unchecked {
            if node.id == self.inner.local_id {
                continue;
            }

            if let Some(known) = state.available.iter_mut().find(|e| e.id == node.id) {
                // Node restarted and announced a different address
                known.addresses = node.addresses;
                continue;
            }

            let Some(first) = node.addresses.first().copied() else {
                continue;
            };

            if state.used.iter().any(|u| u.relay_address == first) {
                continue;
            }

            to_check.push(PeerRecord {
                id: node.id,
                addresses: vec![first],
            });
        }

        to_check
    }

    /// Probe all unchecked and available nodes and use the fastest ones.
    ///
    /// Runs one at a time. Emits [`RelayChanged`] if the set of used relays
    /// differs from before.
    pub async fn update_public_nodes(&self) {
        let _guard = self.inner.update_lock.lock().await;
        tracing::debug!("[{}] updating list of used relay nodes", self.inner.tag);

        let to_check: Vec<(PeerId, Address)> = {
            let mut state = self.inner.state.write().await;
            let mut nodes = self.filter_unchecked_nodes(&mut state);
            nodes.extend(state.available.iter().map(|e| PeerRecord {
                id: e.id,
                addresses: e.addresses.clone(),
            }));
            nodes
                .into_iter()
                .filter_map(|n| n.addresses.first().map(|a| (n.id, *a)))
                .collect()
        };

        let start = Instant::now();
        let checked = to_check.len();
        let mut results: Vec<ProbeResult> = futures::stream::iter(to_check)
            .map(|(id, addr)| self.connect_to_relay(id, addr))
            .buffer_unordered(self.inner.config.max_parallel_dials.max(1))
            .filter(|r| futures::future::ready(r.entry.latency >= 0))
            .collect()
            .await;
        results.sort_by_key(|r| r.entry.latency);

        tracing::debug!(
            "[{}] checking {} potential entry nodes done in {} ms",
            self.inner.tag,
            checked,
            start.elapsed().as_millis()
        );

        let mut state = self.inner.state.write().await;
        let previous: HashSet<PeerId> = state.used.iter().map(|u| u.relay).collect();

        for (_, watcher) in state.kept.drain() {
            watcher.abort();
        }

        if results.is_empty() {
            tracing::warn!(
                "[{}] could not connect to any entry node, other nodes may not be able to reach this node",
                self.inner.tag
            );
        }

        state.available = results.iter().map(|r| r.entry.clone()).collect();
        state.used.clear();

        // Streams of the nodes beyond the limit are dropped, which closes them
        for result in results.into_iter().take(self.inner.config.max_relays) {
            let Some(relay_address) = result.entry.addresses.first().copied() else {
                continue;
            };
            state.used.push(UsedRelay {
                relay: result.entry.id,
                relay_address,
                circuit_address: Address::circuit(result.entry.id, self.inner.local_id),
            });
            if let Some(stream) = result.stream {
                let watcher = self.keep_connection(result.entry.id, stream);
                state.kept.insert(result.entry.id, watcher);
            }
        }

        let is_different = state.used.len() != previous.len()
            || state.used.iter().any(|u| !previous.contains(&u.relay));

        if is_different {
            let circuit_addresses: Vec<Address> =
                state.used.iter().map(|u| u.circuit_address).collect();
            for addr in &circuit_addresses {
                tracing::debug!("[{}] current relay address {}", self.inner.tag, addr);
            }
            // No subscribers is fine
            let _ = self.inner.events.send(RelayChanged { circuit_addresses });
        }
    }

    /// Dial `id` at `addr` over the can-relay protocol and measure the time
    /// until it answers `OK`.
    async fn connect_to_relay(&self, id: PeerId, addr: Address) -> ProbeResult {
        let start = Instant::now();
        let timeout = self.inner.config.contact_timeout;
        let failed = |addr: Address| ProbeResult {
            entry: EntryNodeRecord {
                id,
                addresses: vec![addr],
                latency: UNREACHABLE,
            },
            stream: None,
        };

        let dial_addr = addr.with_peer(id);
        let dial = self.inner.dialer.dial(&dial_addr, Protocol::CanRelay);
        let mut stream = match tokio::time::timeout(timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!("[{}] error while contacting entry node {}: {}", self.inner.tag, id.short(), e);
                return failed(addr);
            }
            Err(_) => {
                tracing::debug!("[{}] contacting entry node {} timed out", self.inner.tag, id.short());
                return failed(addr);
            }
        };

        let remaining = timeout.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, stream.recv()).await {
            Ok(Some(answer)) if answer.as_ref() == CAN_RELAY_OK => ProbeResult {
                entry: EntryNodeRecord {
                    id,
                    addresses: vec![addr],
                    latency: start.elapsed().as_millis() as i64,
                },
                stream: Some(stream),
            },
            Ok(Some(answer)) => {
                tracing::debug!(
                    "[{}] entry node {} refused to relay: {:?}",
                    self.inner.tag,
                    id.short(),
                    String::from_utf8_lossy(&answer)
                );
                failed(addr)
            }
            Ok(None) | Err(_) => failed(addr),
        }
    }

    /// Hold `stream` open and reconnect once the remote end drops it
    fn keep_connection(&self, id: PeerId, mut stream: Stream) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while stream.recv().await.is_some() {}
            drop(stream);
            if let Some(nodes) = upgrade(&weak) {
                nodes.on_entry_disconnect(id).await;
            }
        })
    }

    async fn on_entry_disconnect(&self, id: PeerId) {
        let relay_address = {
            let mut state = self.inner.state.write().await;
            state.kept.remove(&id);
            match state.used.iter().find(|u| u.relay == id) {
                Some(used) => used.relay_address,
                None => return,
            }
        };

        tracing::debug!("[{}] disconnected from entry node {}", self.inner.tag, id.short());

        let weak = Arc::downgrade(&self.inner);
        let base = self.inner.config.reconnect_base_timeout;
        let backoff = self.inner.config.reconnect_backoff.max(1);
        let max_delay = base * 10;

        let task = tokio::spawn(async move {
            let mut delay = base;
            let mut attempt = 0u32;
            loop {
                tokio::time::sleep(delay).await;
                let Some(nodes) = upgrade(&weak) else { return };

                if !nodes.inner.state.read().await.used.iter().any(|u| u.relay == id) {
                    return;
                }

                attempt += 1;
                let result = nodes.connect_to_relay(id, relay_address).await;
                let success = result.entry.latency >= 0;
                tracing::debug!(
                    "[{}] reconnect attempt {} to entry node {} was {}",
                    nodes.inner.tag,
                    attempt,
                    id.short(),
                    if success { "successful" } else { "not successful" }
                );

                if let Some(stream) = result.stream {
                    let mut state = nodes.inner.state.write().await;
                    if state.used.iter().any(|u| u.relay == id) {
                        let watcher = nodes.keep_connection(id, stream);
                        if let Some(old) = state.kept.insert(id, watcher) {
                            old.abort();
                        }
                    }
                    return;
                }

                delay = (delay * backoff).min(max_delay);
            }
        });
        let mut tasks = self.inner.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Contact the used relays again so they renew their DHT announcement
    async fn renew_dht_entries(&self) {
        let work: Vec<(PeerId, Address)> = {
            let state = self.inner.state.read().await;
            state
                .used
                .iter()
                .filter_map(|used| {
                    let entry = state.available.iter().find(|e| e.id == used.relay);
                    if entry.is_none() {
                        tracing::debug!(
                            "[{}] relay {} is no longer available, not renewing",
                            self.inner.tag,
                            used.relay.short()
                        );
                    }
                    entry.and_then(|e| e.addresses.first().map(|a| (e.id, *a)))
                })
                .collect()
        };

        let results: Vec<ProbeResult> = futures::stream::iter(work)
            .map(|(id, addr)| self.connect_to_relay(id, addr))
            .buffer_unordered(self.inner.config.max_parallel_dials.max(1))
            .collect()
            .await;

        let mut state = self.inner.state.write().await;
        for result in results {
            let id = result.entry.id;
            if let Some(entry) = state.available.iter_mut().find(|e| e.id == id) {
                entry.latency = result.entry.latency;
            }
            if let Some(stream) = result.stream {
                let watcher = self.keep_connection(id, stream);
                if let Some(old) = state.kept.insert(id, watcher) {
                    old.abort();
                }
            }
        }
    }
}

impl EntryNodesInner {
    fn add_unchecked(&self, state: &mut EntryState, peer: PeerRecord) -> bool {
        if peer.id == self.local_id {
            return false;
        }

        if peer.addresses.is_empty() {
            tracing::debug!(
                "[{}] received entry node {} without any address",
                self.tag,
                peer.id.short()
            );
            return false;
        }

        if state.unchecked.iter().any(|n| n.id == peer.id) {
            tracing::debug!("[{}] received duplicate entry node {}", self.tag, peer.id.short());
            return false;
        }

        let addresses = self.filter.filter(&peer.addresses);
        if addresses.is_empty() {
            tracing::debug!(
                "[{}] entry node {} has no usable relay address",
                self.tag,
                peer.id.short()
            );
            return false;
        }

        state.unchecked.push(PeerRecord { id: peer.id, addresses });
        true
    }
}

fn upgrade(weak: &Weak<EntryNodesInner>) -> Option<EntryNodes> {
    weak.upgrade().map(|inner| EntryNodes { inner })
}

impl std::fmt::Debug for EntryNodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryNodes")
            .field("tag", &self.inner.tag)
            .field("local_id", &self.inner.local_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock::MockDialer;
    use relaymesh_core::UsableAddressFilter;

    mod mock {
        use super::*;
        use relaymesh_core::{Error, Result};
        use std::net::SocketAddr;
        use std::sync::atomic::AtomicUsize;
        use std::sync::Mutex as StdMutex;

        #[derive(Clone, Copy)]
        pub struct Behavior {
            pub delay: Duration,
            pub answer: &'static [u8],
        }

        #[derive(Default)]
        pub struct MockDialer {
            pub nodes: StdMutex<HashMap<SocketAddr, Behavior>>,
            pub remotes: StdMutex<HashMap<SocketAddr, Vec<Stream>>>,
            pub dials: AtomicUsize,
        }

        impl MockDialer {
            pub fn add(&self, addr: SocketAddr, delay_ms: u64) {
                self.nodes.lock().unwrap().insert(
                    addr,
                    Behavior {
                        delay: Duration::from_millis(delay_ms),
                        answer: CAN_RELAY_OK,
                    },
                );
            }

            pub fn add_refusing(&self, addr: SocketAddr) {
                self.nodes.lock().unwrap().insert(
                    addr,
                    Behavior {
                        delay: Duration::ZERO,
                        answer: b"NO",
                    },
                );
            }

            pub fn remove(&self, addr: &SocketAddr) {
                self.nodes.lock().unwrap().remove(addr);
            }

            /// Drop the remote ends of all streams to `addr`
            pub fn disconnect(&self, addr: &SocketAddr) {
                self.remotes.lock().unwrap().remove(addr);
            }
        }

        #[async_trait::async_trait]
        impl Dialer for MockDialer {
            async fn dial(&self, addr: &Address, _protocol: Protocol) -> Result<Stream> {
                self.dials.fetch_add(1, Ordering::SeqCst);
                let sock = addr.socket_addr().ok_or_else(|| Error::dial("not direct"))?;
                let behavior = self.nodes.lock().unwrap().get(&sock).copied();
                let Some(behavior) = behavior else {
                    return Err(Error::dial("unreachable"));
                };
                tokio::time::sleep(behavior.delay).await;

                let (local, remote) = Stream::pair();
                remote.send(behavior.answer).await?;
                self.remotes
                    .lock()
                    .unwrap()
                    .entry(sock)
                    .or_default()
                    .push(remote);
                Ok(local)
            }

            async fn dial_peer(&self, _peer: &PeerId, _protocol: Protocol) -> Result<Stream> {
                Err(Error::dial("not supported"))
            }
        }
    }

    fn addr(port: u16) -> std::net::SocketAddr {
        format!("198.51.100.1:{}", port).parse().unwrap()
    }

    fn record(id: PeerId, port: u16) -> PeerRecord {
        PeerRecord {
            id,
            addresses: vec![Address::tcp(addr(port))],
        }
    }

    fn manager(dialer: Arc<MockDialer>, config: EntryNodeConfig) -> (PeerId, EntryNodes) {
        let local = PeerId::random();
        let nodes = EntryNodes::new(local, dialer, Arc::new(UsableAddressFilter), config);
        (local, nodes)
    }

    #[tokio::test]
    async fn test_on_new_relay_filters() {
        let dialer = Arc::new(MockDialer::default());
        let (local, nodes) = manager(dialer, EntryNodeConfig::default());
        let other = PeerId::random();

        // Fill up used relays so that no update is triggered
        {
            let mut state = nodes.inner.state.write().await;
            for _ in 0..MAX_RELAYS_PER_NODE {
                let relay = PeerId::random();
                state.used.push(UsedRelay {
                    relay,
                    relay_address: Address::tcp(addr(1)),
                    circuit_address: Address::circuit(relay, local),
                });
            }
        }

        nodes.on_new_relay(record(local, 1)).await;
        nodes
            .on_new_relay(PeerRecord {
                id: other,
                addresses: vec![],
            })
            .await;
        nodes
            .on_new_relay(PeerRecord {
                id: other,
                addresses: vec![Address::circuit(PeerId::random(), other)],
            })
            .await;
        assert!(nodes.unchecked_entry_nodes().await.is_empty());

        nodes.on_new_relay(record(other, 2)).await;
        nodes.on_new_relay(record(other, 3)).await;
        let unchecked = nodes.unchecked_entry_nodes().await;
        assert_eq!(unchecked, vec![record(other, 2)]);
    }

    #[tokio::test]
    async fn test_update_selects_fastest() {
        let dialer = Arc::new(MockDialer::default());
        let seeds: Vec<PeerRecord> = (0..7u16)
            .map(|i| {
                dialer.add(addr(100 + i), u64::from(i) * 15);
                record(PeerId::random(), 100 + i)
            })
            .collect();
        let unreachable = record(PeerId::random(), 999);

        let mut all = seeds.clone();
        all.push(unreachable);
        let config = EntryNodeConfig {
            seed_nodes: all,
            ..EntryNodeConfig::default()
        };
        let (local, nodes) = manager(dialer, config);
        let mut changes = nodes.subscribe();

        nodes.update_public_nodes().await;

        let used = nodes.used_relay_peer_ids().await;
        let expected: Vec<PeerId> = seeds.iter().take(MAX_RELAYS_PER_NODE).map(|s| s.id).collect();
        assert_eq!(used, expected);
        assert_eq!(nodes.available_entry_nodes().await.len(), 7);
        assert!(nodes.unchecked_entry_nodes().await.is_empty());

        let changed = changes.try_recv().unwrap();
        assert_eq!(changed.circuit_addresses.len(), MAX_RELAYS_PER_NODE);
        assert_eq!(
            changed.circuit_addresses[0],
            Address::circuit(seeds[0].id, local)
        );

        // Same outcome, no notification
        nodes.update_public_nodes().await;
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refusing_and_unreachable_nodes_unused() {
        let dialer = Arc::new(MockDialer::default());
        let refusing = record(PeerId::random(), 10);
        dialer.add_refusing(addr(10));
        let config = EntryNodeConfig {
            seed_nodes: vec![refusing, record(PeerId::random(), 11)],
            ..EntryNodeConfig::default()
        };
        let (_, nodes) = manager(dialer, config);
        let mut changes = nodes.subscribe();

        nodes.update_public_nodes().await;
        assert!(nodes.used_relays().await.is_empty());
        assert!(nodes.available_entry_nodes().await.is_empty());
        // Nothing was used before either
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_used_relay_rebuilds() {
        let dialer = Arc::new(MockDialer::default());
        dialer.add(addr(20), 0);
        dialer.add(addr(21), 0);
        let a = record(PeerId::random(), 20);
        let b = record(PeerId::random(), 21);
        let config = EntryNodeConfig {
            seed_nodes: vec![a.clone(), b.clone()],
            max_relays: 1,
            ..EntryNodeConfig::default()
        };
        let (_, nodes) = manager(dialer.clone(), config);
        nodes.update_public_nodes().await;

        let used = nodes.used_relay_peer_ids().await;
        assert_eq!(used.len(), 1);
        let (gone, spare) = if used[0] == a.id { (&a, &b) } else { (&b, &a) };

        // Removing an unused node does not rebuild
        let dials = dialer.dials.load(Ordering::SeqCst);
        nodes.on_remove_relay(&spare.id).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), dials);

        nodes.on_new_relay(spare.clone()).await;
        dialer.remove(&addr(if gone.id == a.id { 20 } else { 21 }));
        nodes.on_remove_relay(&gone.id).await;
        assert_eq!(nodes.used_relay_peer_ids().await, vec![spare.id]);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let dialer = Arc::new(MockDialer::default());
        dialer.add(addr(30), 0);
        let config = EntryNodeConfig {
            seed_nodes: vec![record(PeerId::random(), 30)],
            reconnect_base_timeout: Duration::from_millis(20),
            ..EntryNodeConfig::default()
        };
        let (_, nodes) = manager(dialer.clone(), config);
        nodes.update_public_nodes().await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        dialer.disconnect(&addr(30));

        tokio::time::timeout(Duration::from_secs(2), async {
            while dialer.dials.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(nodes.used_relays().await.len(), 1);
        assert_eq!(nodes.inner.state.read().await.kept.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_tasks_are_pruned() {
        let dialer = Arc::new(MockDialer::default());
        dialer.add(addr(31), 0);
        let config = EntryNodeConfig {
            seed_nodes: vec![record(PeerId::random(), 31)],
            reconnect_base_timeout: Duration::from_millis(10),
            ..EntryNodeConfig::default()
        };
        let (_, nodes) = manager(dialer.clone(), config);
        nodes.update_public_nodes().await;

        for round in 2..=5 {
            dialer.disconnect(&addr(31));
            tokio::time::timeout(Duration::from_secs(2), async {
                while dialer.dials.load(Ordering::SeqCst) < round
                    || nodes.inner.state.read().await.kept.len() != 1
                {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }

        // Only the latest reconnect task can still be tracked
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(nodes.inner.tasks.lock().await.len() <= 1);
    }
}
