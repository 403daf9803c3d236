//! TCP and UDP listener.
//!
//! ```text
//!              ┌──────────────── Listener ────────────────┐
//! TCP :port ──►│ accept ─► framed Stream ─► Upgrader ─────│──► ListenerEvent::Connection
//! UDP :port ◄─►│ StunSocket (answers binding requests)    │
//!              │ external address ◄─ STUN via entry nodes │
//!              │ EntryNodes::subscribe ───────────────────│──► ListenerEvent::Listening
//!              └──────────────────────────────────────────┘
//! ```
//!
//! Both sockets share one port number: TCP is bound first, UDP then takes
//! the same number. Other nodes use the UDP side as STUN server, which is
//! how the external address of every node gets determined.

use crate::error::{Result, TransportError};
use futures::future::join_all;
use relaymesh_core::{Address, InboundStream, PeerId, StreamTask, Stream, Upgrader};
use relaymesh_discovery::EntryNodes;
use relaymesh_discovery::nat::{
    ExternalAddressConfig, InterfaceOptions, StunSocket, determine_external_address, get_addrs,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Longest time [`Listener::close`] waits for its tasks
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

const TCP_BACKLOG: i32 = 1024;

/// Listener settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Interface addresses to advertise when bound to an unspecified host
    pub interfaces: InterfaceOptions,
    /// External address determination
    pub external: ExternalAddressConfig,
    /// STUN servers asked in addition to the known entry nodes
    pub stun_servers: Vec<SocketAddr>,
    /// Longest time `close()` waits
    pub close_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            interfaces: InterfaceOptions::local(),
            external: ExternalAddressConfig::default(),
            stun_servers: Vec::new(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Lifecycle events of a [`Listener`]
#[derive(Debug)]
pub enum ListenerEvent {
    /// Listening started or the advertised addresses changed
    Listening,
    /// An upgraded inbound connection
    Connection(InboundStream),
    /// The listener closed
    Close,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bind_error(addr: SocketAddr) -> impl Fn(std::io::Error) -> TransportError {
    move |e| TransportError::BindFailed(format!("{}: {}", addr, e))
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let err = bind_error(addr);
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(&err)?;
    socket.set_reuse_address(true).map_err(&err)?;
    socket.bind(&addr.into()).map_err(&err)?;
    socket.listen(TCP_BACKLOG).map_err(&err)?;
    socket.set_nonblocking(true).map_err(&err)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(err)
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let err = bind_error(addr);
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(&err)?;
    socket.bind(&addr.into()).map_err(&err)?;
    socket.set_nonblocking(true).map_err(&err)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(err)
}

/// State while listening
struct Bound {
    tcp_addr: SocketAddr,
    stun: Arc<StunSocket>,
    interface_addrs: Vec<Address>,
    external: Option<Address>,
    tasks: Vec<JoinHandle<()>>,
}

/// What the accept loop needs, kept apart from the listener so the loop
/// does not keep it alive
#[derive(Clone)]
struct Acceptor {
    tag: String,
    upgrader: Arc<dyn Upgrader>,
    events: mpsc::UnboundedSender<ListenerEvent>,
    connections: Arc<Mutex<Vec<StreamTask>>>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        loop {
            let (socket, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("LISTENER [{}] accept failed: {}", self.tag, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                tracing::trace!("LISTENER [{}] nodelay on {}: {}", self.tag, remote, e);
            }

            let (stream, task) = Stream::framed(socket);
            {
                let mut connections = lock(&self.connections);
                connections.retain(|task| !task.is_finished());
                connections.push(task);
            }

            let acceptor = self.clone();
            tokio::spawn(async move { acceptor.upgrade(stream, remote).await });
        }
    }

    async fn upgrade(&self, stream: Stream, remote: SocketAddr) {
        match self.upgrader.upgrade_inbound(stream, remote).await {
            Ok(inbound) => {
                tracing::debug!(
                    "LISTENER [{}] {} from {}",
                    self.tag,
                    inbound.protocol,
                    inbound.remote_peer.short()
                );
                let _ = self.events.send(ListenerEvent::Connection(inbound));
            }
            Err(e) => tracing::debug!("LISTENER [{}] upgrade of {} failed: {}", self.tag, remote, e),
        }
    }
}

struct ListenerInner {
    local_id: PeerId,
    config: ListenerConfig,
    entry_nodes: Option<EntryNodes>,
    acceptor: Acceptor,
    bound: Mutex<Option<Bound>>,
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Some(bound) = lock(&self.bound).take() {
            for task in bound.tasks {
                task.abort();
            }
        }
        for task in lock(&self.acceptor.connections).drain(..) {
            task.abort();
        }
    }
}

/// TCP+UDP listener of a node. Cloning yields another handle to the same
/// listener.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("tag", &self.inner.acceptor.tag)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl Listener {
    /// Create a listener for node `local_id`.
    ///
    /// Returns the listener and its event channel. With `entry_nodes` the
    /// listener refreshes them on `listen()`, uses them as STUN servers and
    /// advertises their circuit addresses.
    #[must_use]
    pub fn new(
        local_id: PeerId,
        upgrader: Arc<dyn Upgrader>,
        entry_nodes: Option<EntryNodes>,
        config: ListenerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let listener = Self {
            inner: Arc::new(ListenerInner {
                local_id,
                config,
                entry_nodes,
                acceptor: Acceptor {
                    tag: relaymesh_core::instance_tag(),
                    upgrader,
                    events,
                    connections: Arc::new(Mutex::new(Vec::new())),
                },
                bound: Mutex::new(None),
            }),
        };
        (listener, events_rx)
    }

    fn tag(&self) -> &str {
        &self.inner.acceptor.tag
    }

    fn emit(&self, event: ListenerEvent) {
        let _ = self.inner.acceptor.events.send(event);
    }

    /// Bind TCP and UDP on `addr`, determine the external address and
    /// refresh the entry nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener already listens or a socket cannot
    /// be bound.
    pub async fn listen(&self, addr: SocketAddr) -> Result<()> {
        if let Some(local) = self.local_addr() {
            return Err(TransportError::AlreadyListening(local));
        }
        self.inner.config.interfaces.validate()?;

        let tcp = bind_tcp(addr)?;
        let tcp_addr = tcp.local_addr()?;
        let udp = bind_udp(SocketAddr::new(addr.ip(), tcp_addr.port()))?;
        let stun = StunSocket::new(Arc::new(udp), true);

        let interface_addrs = if addr.ip().is_unspecified() {
            get_addrs(tcp_addr.port(), &self.inner.config.interfaces)?
        } else {
            vec![Address::tcp(tcp_addr)]
        };

        let tasks = vec![
            stun.spawn_receiver(),
            tokio::spawn(self.inner.acceptor.clone().run(tcp)),
        ];

        {
            let mut bound = lock(&self.inner.bound);
            if let Some(other) = bound.as_ref() {
                for task in tasks {
                    task.abort();
                }
                return Err(TransportError::AlreadyListening(other.tcp_addr));
            }
            *bound = Some(Bound {
                tcp_addr,
                stun: stun.clone(),
                interface_addrs,
                external: None,
                tasks,
            });
        }
        tracing::info!("LISTENER [{}] listening on {}", self.tag(), tcp_addr);

        let external = self.determine_external(&stun).await;
        if let Some(bound) = lock(&self.inner.bound).as_mut() {
            bound.external = external.map(Address::tcp);
        }
        match external {
            Some(external) => tracing::info!("LISTENER [{}] external address {}", self.tag(), external),
            None => tracing::info!("LISTENER [{}] no public address", self.tag()),
        }

        if let Some(entry_nodes) = &self.inner.entry_nodes {
            entry_nodes.update_public_nodes().await;
            let watcher = self.watch_relays(entry_nodes);
            match lock(&self.inner.bound).as_mut() {
                Some(bound) => bound.tasks.push(watcher),
                None => watcher.abort(),
            }
        }

        self.emit(ListenerEvent::Listening);
        Ok(())
    }

    /// STUN candidates: the entry nodes except this node, then configured
    /// servers
    async fn stun_candidates(&self) -> Vec<SocketAddr> {
        let mut candidates = Vec::new();
        if let Some(entry_nodes) = &self.inner.entry_nodes {
            let available = entry_nodes
                .available_entry_nodes()
                .await
                .into_iter()
                .map(|entry| (entry.id, entry.addresses));
            let unchecked = entry_nodes
                .unchecked_entry_nodes()
                .await
                .into_iter()
                .map(|peer| (peer.id, peer.addresses));
            for (id, addrs) in available.chain(unchecked) {
                if id == self.inner.local_id {
                    continue;
                }
                candidates.extend(addrs.iter().filter_map(Address::socket_addr));
            }
        }
        candidates.extend(self.inner.config.stun_servers.iter().copied());

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|addr| seen.insert(*addr));
        candidates
    }

    async fn determine_external(&self, stun: &StunSocket) -> Option<SocketAddr> {
        let candidates = self.stun_candidates().await;
        tracing::debug!(
            "LISTENER [{}] asking {} nodes for the external address",
            self.tag(),
            candidates.len()
        );
        determine_external_address(stun, &candidates, &self.inner.config.external).await
    }

    /// Re-emit `Listening` whenever the used relays change
    fn watch_relays(&self, entry_nodes: &EntryNodes) -> JoinHandle<()> {
        let mut changes = entry_nodes.subscribe();
        let events = self.inner.acceptor.events.clone();
        let tag = self.tag().to_string();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        tracing::debug!(
                            "LISTENER [{}] relays changed, {} circuit addresses",
                            tag,
                            change.circuit_addresses.len()
                        );
                        if events.send(ListenerEvent::Listening).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        let _ = events.send(ListenerEvent::Listening);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Bound TCP address, `None` unless listening
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.bound).as_ref().map(|bound| bound.tcp_addr)
    }

    /// External address determined via STUN
    #[must_use]
    pub fn external_addr(&self) -> Option<Address> {
        lock(&self.inner.bound).as_ref().and_then(|bound| bound.external)
    }

    /// The STUN socket sharing the listening port
    #[must_use]
    pub fn stun_socket(&self) -> Option<Arc<StunSocket>> {
        lock(&self.inner.bound).as_ref().map(|bound| bound.stun.clone())
    }

    /// Advertised addresses: external address, then relay circuit
    /// addresses, then interface addresses
    pub async fn get_addrs(&self) -> Vec<Address> {
        let (external, interfaces) = match lock(&self.inner.bound).as_ref() {
            Some(bound) => (bound.external, bound.interface_addrs.clone()),
            None => (None, Vec::new()),
        };

        let mut addrs: Vec<Address> = external.into_iter().collect();
        if let Some(entry_nodes) = &self.inner.entry_nodes {
            addrs.extend(entry_nodes.used_relay_addresses().await);
        }
        for addr in interfaces {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }

    /// Close tracked connections and both sockets, waiting at most the
    /// configured close timeout
    pub async fn close(&self) {
        let Some(bound) = lock(&self.inner.bound).take() else {
            return;
        };

        let connections: Vec<StreamTask> = lock(&self.inner.acceptor.connections).drain(..).collect();
        for connection in &connections {
            connection.abort();
        }
        for task in &bound.tasks {
            task.abort();
        }
        drop(bound.stun);

        if tokio::time::timeout(self.inner.config.close_timeout, join_all(bound.tasks))
            .await
            .is_err()
        {
            tracing::debug!("LISTENER [{}] close timed out", self.tag());
        }

        tracing::info!("LISTENER [{}] closed {}", self.tag(), bound.tcp_addr);
        self.emit(ListenerEvent::Close);
    }
}
