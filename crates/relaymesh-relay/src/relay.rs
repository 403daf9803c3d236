//! Relay service.
//!
//! Serves the three relay protocols of a node and opens relayed
//! connections through other nodes:
//!
//! - `relay`: this node forwards bytes between an initiator and a
//!   destination
//! - `delivery`: a relay hands this node an incoming relayed connection
//! - `can-relay`: an entry node manager asks whether this node relays
//!
//! Incoming relayed connections, including the ones created when a
//! counterparty reconnects, are emitted on the channel returned by
//! [`Relay::new`].

use crate::connection::{ConnectionOptions, RelayConnection, RelayConnectionHandle, Timeline};
use crate::error::{HandshakeStatus, RelayError, Result};
use crate::handshake::RelayHandshake;
use crate::state::RelayState;
use crate::webrtc::{
    DirectChannel, DirectChannelFactory, TcpChannelFactory, WebRtcConfig, WebRtcConnection,
};
use bytes::Bytes;
use relaymesh_core::{
    Address, Announcer, CAN_RELAY_OK, Dialer, InboundStream, PeerId, Protocol, Stream,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Domain separation tag of [`relayer_key`]
const RELAYER_KEY_DOMAIN: &[u8] = b"relaymesh/relayer/v1";

/// Relay service settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Circuits this node forwards at most
    pub max_relayed_connections: usize,
    /// Timeout for dialing a relay or a destination and for the handshake
    pub circuit_timeout: Duration,
    /// Delay before a slot is freed after an upgrade
    pub relay_free_timeout: Duration,
    /// How often dead circuits are pruned, never if `None`
    pub prune_interval: Option<Duration>,
    /// Direct channel upgrade, relayed connections stay relayed if `None`
    pub webrtc: Option<WebRtcConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_relayed_connections: 10,
            circuit_timeout: Duration::from_secs(6),
            relay_free_timeout: Duration::ZERO,
            prune_interval: Some(Duration::from_secs(60)),
            webrtc: Some(WebRtcConfig::default()),
        }
    }
}

/// DHT key under which `peer` announces that it relays
#[must_use]
pub fn relayer_key(peer: &PeerId) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(RELAYER_KEY_DOMAIN);
    hasher.update(peer.as_bytes());
    hasher.finalize().into()
}

/// A relayed connection as handed to the application
#[derive(Debug)]
pub enum RelayedConnection {
    /// Stays on the relay
    Relay(RelayConnection),
    /// Moves to a direct channel once one is up
    WebRtc(WebRtcConnection),
}

impl RelayedConnection {
    /// Control handle of the underlying relayed connection
    #[must_use]
    pub fn relay_handle(&self) -> &RelayConnectionHandle {
        match self {
            Self::Relay(conn) => conn.handle(),
            Self::WebRtc(conn) => conn.handle().relay(),
        }
    }

    /// Node at the other end
    #[must_use]
    pub fn counterparty(&self) -> PeerId {
        self.relay_handle().counterparty()
    }

    /// Circuit address of the connection
    #[must_use]
    pub fn remote_addr(&self) -> Address {
        self.relay_handle().remote_addr()
    }

    /// Open and close timestamps
    #[must_use]
    pub fn timeline(&self) -> Timeline {
        match self {
            Self::Relay(conn) => conn.handle().timeline(),
            Self::WebRtc(conn) => conn.handle().timeline(),
        }
    }

    /// Send application bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection no longer accepts data.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        match self {
            Self::Relay(conn) => conn.send(data).await,
            Self::WebRtc(conn) => conn.send(data).await,
        }
    }

    /// Receive application bytes, `None` once the connection ended
    pub async fn recv(&mut self) -> Option<Bytes> {
        match self {
            Self::Relay(conn) => conn.recv().await,
            Self::WebRtc(conn) => conn.recv().await,
        }
    }

    /// Close the connection
    pub async fn close(&self) {
        match self {
            Self::Relay(conn) => conn.handle().close().await,
            Self::WebRtc(conn) => conn.handle().close().await,
        }
    }

    /// Application stream, detached from the control handle
    #[must_use]
    pub fn into_stream(self) -> Stream {
        match self {
            Self::Relay(conn) => conn.into_parts().0,
            Self::WebRtc(conn) => conn.into_parts().0,
        }
    }
}

struct RelayInner {
    tag: String,
    local_id: PeerId,
    config: RelayConfig,
    dialer: Arc<dyn Dialer>,
    announcer: Option<Arc<dyn Announcer>>,
    channel_factory: Option<Arc<dyn DirectChannelFactory>>,
    state: RelayState,
    incoming: mpsc::UnboundedSender<RelayedConnection>,
    reconnect: mpsc::UnboundedSender<RelayConnection>,
    used_relays: Mutex<Vec<PeerId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Relay service of one node. Cloning yields another handle to the same
/// service.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("tag", &self.inner.tag)
            .field("local_id", &self.inner.local_id.short())
            .field("circuits", &self.inner.state.size())
            .finish()
    }
}

impl Relay {
    /// Create the service of node `local_id`.
    ///
    /// Returns the service and the channel of incoming relayed connections.
    /// The bundled TCP direct channel is used if `config.webrtc` is set.
    #[must_use]
    pub fn new(
        local_id: PeerId,
        dialer: Arc<dyn Dialer>,
        announcer: Option<Arc<dyn Announcer>>,
        config: RelayConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RelayedConnection>) {
        let factory = config.webrtc.as_ref().map(|webrtc| {
            Arc::new(TcpChannelFactory::new(webrtc.channel.clone())) as Arc<dyn DirectChannelFactory>
        });
        Self::with_channel_factory(local_id, dialer, announcer, config, factory)
    }

    /// Like [`Relay::new`] with a custom direct channel factory
    #[must_use]
    pub fn with_channel_factory(
        local_id: PeerId,
        dialer: Arc<dyn Dialer>,
        announcer: Option<Arc<dyn Announcer>>,
        config: RelayConfig,
        channel_factory: Option<Arc<dyn DirectChannelFactory>>,
    ) -> (Self, mpsc::UnboundedReceiver<RelayedConnection>) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let channel_factory = if config.webrtc.is_some() {
            channel_factory
        } else {
            None
        };

        let relay = Self {
            inner: Arc::new(RelayInner {
                tag: relaymesh_core::instance_tag(),
                local_id,
                state: RelayState::new(config.relay_free_timeout),
                config,
                dialer,
                announcer,
                channel_factory,
                incoming: incoming_tx,
                reconnect: reconnect_tx,
                used_relays: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let mut tasks = vec![tokio::spawn(forward_reconnects(
            relay.inner.tag.clone(),
            reconnect_rx,
            relay.inner.incoming.clone(),
            relay.upgrade_timeout(),
        ))];
        if let Some(interval) = relay.inner.config.prune_interval {
            tasks.push(tokio::spawn(prune_loop(relay.inner.state.clone(), interval)));
        }
        *lock(&relay.inner.tasks) = tasks;

        tracing::debug!("RELAY [{}] service for {}", relay.inner.tag, local_id.short());
        (relay, incoming_rx)
    }

    fn upgrade_timeout(&self) -> Option<Duration> {
        self.inner
            .config
            .webrtc
            .as_ref()
            .map(|webrtc| webrtc.upgrade_timeout)
    }

    /// Identity of this node
    #[must_use]
    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// Circuits forwarded by this node
    #[must_use]
    pub fn state(&self) -> &RelayState {
        &self.inner.state
    }

    /// Relays this node is currently reachable through
    #[must_use]
    pub fn used_relays(&self) -> Vec<PeerId> {
        lock(&self.inner.used_relays).clone()
    }

    /// Replace the set of relays this node is reachable through
    pub fn set_used_relays(&self, relays: Vec<PeerId>) {
        tracing::debug!("RELAY [{}] {} used relays", self.inner.tag, relays.len());
        *lock(&self.inner.used_relays) = relays;
    }

    fn wrap(&self, conn: RelayConnection) -> RelayedConnection {
        wrap(conn, self.upgrade_timeout())
    }

    async fn channel(&self, outbound: bool) -> Option<Arc<dyn DirectChannel>> {
        let factory = self.inner.channel_factory.as_ref()?;
        let channel = if outbound {
            factory.outbound().await
        } else {
            factory.inbound().await
        };
        match channel {
            Ok(channel) => Some(channel),
            Err(e) => {
                tracing::debug!("RELAY [{}] no direct channel: {}", self.inner.tag, e);
                None
            }
        }
    }

    fn options(&self, channel: Option<Arc<dyn DirectChannel>>) -> ConnectionOptions {
        ConnectionOptions {
            on_reconnect: Some(self.inner.reconnect.clone()),
            channel,
            channel_factory: self.inner.channel_factory.clone(),
        }
    }

    /// Open a connection to `destination` through `relay`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Timeout`] if the relay could not be reached in
    /// time and [`RelayError::Handshake`] if it refused the circuit.
    pub async fn connect(&self, relay: &PeerId, destination: &PeerId) -> Result<RelayedConnection> {
        let timeout = self.inner.config.circuit_timeout;
        tracing::debug!(
            "RELAY [{}] connecting to {} via {}",
            self.inner.tag,
            destination.short(),
            relay.short()
        );

        let stream = tokio::time::timeout(timeout, self.inner.dialer.dial_peer(relay, Protocol::Relay))
            .await
            .map_err(|_| RelayError::Timeout)??;
        let stream = tokio::time::timeout(timeout, RelayHandshake::new(stream).initiate(relay, destination))
            .await
            .map_err(|_| RelayError::Timeout)??;

        let channel = self.channel(true).await;
        let conn = RelayConnection::new(stream, *relay, *destination, self.options(channel));
        tracing::info!(
            "RELAY [{}] connected to {} via {}",
            self.inner.tag,
            destination.short(),
            relay.short()
        );
        Ok(self.wrap(conn))
    }

    /// Serve one inbound stream of any of the relay protocols
    pub async fn dispatch(&self, inbound: InboundStream) {
        let InboundStream {
            remote_peer,
            protocol,
            stream,
        } = inbound;
        match protocol {
            Protocol::Relay => self.handle_relay(remote_peer, stream).await,
            Protocol::Delivery => {
                if let Err(e) = self.handle_delivery(remote_peer, stream).await {
                    tracing::debug!(
                        "RELAY [{}] delivery from {} failed: {}",
                        self.inner.tag,
                        remote_peer.short(),
                        e
                    );
                }
            }
            Protocol::CanRelay => self.handle_can_relay(remote_peer, stream).await,
        }
    }

    /// `remote` asks this node to relay. The circuit runs in its own task.
    pub async fn handle_relay(&self, remote: PeerId, stream: Stream) {
        let handshake = RelayHandshake::new(stream);
        let Some(slot) = self
            .inner
            .state
            .try_reserve(self.inner.config.max_relayed_connections)
        else {
            tracing::warn!(
                "RELAY [{}] full ({} circuits), rejecting {}",
                self.inner.tag,
                self.inner.state.size(),
                remote.short()
            );
            handshake.reject(HandshakeStatus::FailRelayFull).await;
            return;
        };
        let handshake = handshake.with_slot(slot);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = handshake
                .negotiate(
                    remote,
                    inner.local_id,
                    inner.dialer.as_ref(),
                    &inner.state,
                    inner.config.circuit_timeout,
                )
                .await;
            match result {
                Ok(()) => tracing::debug!("RELAY [{}] circuit of {} ended", inner.tag, remote.short()),
                Err(e) => tracing::debug!(
                    "RELAY [{}] circuit of {} failed: {}",
                    inner.tag,
                    remote.short(),
                    e
                ),
            }
        });
    }

    /// Relay `relay` delivers an incoming relayed connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake failed or nobody listens for
    /// incoming connections.
    pub async fn handle_delivery(&self, relay: PeerId, stream: Stream) -> Result<()> {
        let (stream, initiator) = RelayHandshake::new(stream).handle().await?;
        let channel = self.channel(false).await;
        let conn = RelayConnection::new(stream, relay, initiator, self.options(channel));
        tracing::info!(
            "RELAY [{}] incoming connection from {} via {}",
            self.inner.tag,
            initiator.short(),
            relay.short()
        );
        self.inner
            .incoming
            .send(self.wrap(conn))
            .map_err(|_| RelayError::StreamClosed)
    }

    /// `remote` probes whether this node relays. The stream is kept until
    /// `remote` ends it.
    pub async fn handle_can_relay(&self, remote: PeerId, mut stream: Stream) {
        if let Some(announcer) = self.inner.announcer.clone() {
            let key = relayer_key(&remote);
            let tag = self.inner.tag.clone();
            tokio::spawn(async move {
                if let Err(e) = announcer.announce(key).await {
                    tracing::debug!("RELAY [{}] relayer announcement failed: {}", tag, e);
                }
            });
        }

        if stream.send(Bytes::from_static(CAN_RELAY_OK)).await.is_err() {
            return;
        }
        tokio::spawn(async move { while stream.recv().await.is_some() {} });
    }
}

fn wrap(conn: RelayConnection, upgrade_timeout: Option<Duration>) -> RelayedConnection {
    match upgrade_timeout {
        Some(timeout) if conn.handle().channel().is_some() => {
            RelayedConnection::WebRtc(WebRtcConnection::new(conn, timeout))
        }
        _ => RelayedConnection::Relay(conn),
    }
}

async fn forward_reconnects(
    tag: String,
    mut reconnects: mpsc::UnboundedReceiver<RelayConnection>,
    incoming: mpsc::UnboundedSender<RelayedConnection>,
    upgrade_timeout: Option<Duration>,
) {
    while let Some(conn) = reconnects.recv().await {
        tracing::debug!(
            "RELAY [{}] {} reconnected",
            tag,
            conn.handle().counterparty().short()
        );
        if incoming.send(wrap(conn, upgrade_timeout)).is_err() {
            break;
        }
    }
}

async fn prune_loop(state: RelayState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let pruned = state.prune().await;
        if pruned > 0 {
            tracing::debug!("pruned {} dead circuits", pruned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaymesh_core::Error as CoreError;
    use std::collections::HashMap;
    use std::sync::RwLock;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// In-process network routing dials to registered relay services
    #[derive(Default)]
    struct Net {
        nodes: RwLock<HashMap<PeerId, Relay>>,
    }

    struct NetDialer {
        local: PeerId,
        net: Arc<Net>,
    }

    #[async_trait]
    impl Dialer for NetDialer {
        async fn dial(&self, addr: &Address, protocol: Protocol) -> relaymesh_core::Result<Stream> {
            let peer = addr
                .peer_id()
                .ok_or_else(|| CoreError::dial("address without peer"))?;
            self.dial_peer(&peer, protocol).await
        }

        async fn dial_peer(&self, peer: &PeerId, protocol: Protocol) -> relaymesh_core::Result<Stream> {
            let target = self
                .net
                .nodes
                .read()
                .unwrap()
                .get(peer)
                .cloned()
                .ok_or_else(|| CoreError::dial("unknown peer"))?;
            let (local, remote) = Stream::pair();
            let inbound = InboundStream {
                remote_peer: self.local,
                protocol,
                stream: remote,
            };
            tokio::spawn(async move { target.dispatch(inbound).await });
            Ok(local)
        }
    }

    #[derive(Default)]
    struct RecordingAnnouncer {
        keys: Mutex<Vec<[u8; 32]>>,
    }

    #[async_trait]
    impl Announcer for RecordingAnnouncer {
        async fn announce(&self, key: [u8; 32]) -> relaymesh_core::Result<()> {
            self.keys.lock().unwrap().push(key);
            Ok(())
        }
    }

    fn relay_config() -> RelayConfig {
        RelayConfig {
            webrtc: None,
            prune_interval: None,
            ..RelayConfig::default()
        }
    }

    fn node(
        net: &Arc<Net>,
        config: RelayConfig,
    ) -> (Relay, mpsc::UnboundedReceiver<RelayedConnection>) {
        let id = PeerId::random();
        let dialer = Arc::new(NetDialer {
            local: id,
            net: net.clone(),
        });
        let (relay, incoming) = Relay::new(id, dialer, None, config);
        net.nodes.write().unwrap().insert(id, relay.clone());
        (relay, incoming)
    }

    #[test]
    fn test_relayer_key() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_eq!(relayer_key(&a), relayer_key(&a));
        assert_ne!(relayer_key(&a), relayer_key(&b));
        assert_ne!(relayer_key(&a), *blake3::hash(a.as_bytes()).as_bytes());
    }

    #[tokio::test]
    async fn test_connect_through_relay() {
        let net = Arc::new(Net::default());
        let (alice, _) = node(&net, relay_config());
        let (relay, _) = node(&net, relay_config());
        let (bob, mut bob_incoming) = node(&net, relay_config());

        let mut to_bob = alice.connect(&relay.local_id(), &bob.local_id()).await.unwrap();
        assert_eq!(to_bob.counterparty(), bob.local_id());
        assert_eq!(
            to_bob.remote_addr(),
            Address::circuit(relay.local_id(), bob.local_id())
        );

        let mut from_alice = tokio::time::timeout(TIMEOUT, bob_incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from_alice.counterparty(), alice.local_id());
        assert!(matches!(from_alice, RelayedConnection::Relay(_)));

        to_bob.send(Bytes::from_static(b"hello bob")).await.unwrap();
        assert_eq!(
            tokio::time::timeout(TIMEOUT, from_alice.recv()).await.unwrap().unwrap(),
            Bytes::from_static(b"hello bob")
        );
        from_alice.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(
            tokio::time::timeout(TIMEOUT, to_bob.recv()).await.unwrap().unwrap(),
            Bytes::from_static(b"hi")
        );
        assert_eq!(relay.state().size(), 1);

        to_bob.close().await;
        let mut destroyed = from_alice.relay_handle().destroyed();
        tokio::time::timeout(TIMEOUT, destroyed.wait_for(|d| *d))
            .await
            .unwrap()
            .unwrap();
        assert!(from_alice.timeline().close.is_some());

        tokio::time::timeout(TIMEOUT, async {
            while relay.state().size() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_full_relay_rejects() {
        let net = Arc::new(Net::default());
        let (alice, _) = node(&net, relay_config());
        let (relay, _) = node(
            &net,
            RelayConfig {
                max_relayed_connections: 0,
                ..relay_config()
            },
        );
        let (bob, _) = node(&net, relay_config());

        let err = alice
            .connect(&relay.local_id(), &bob.local_id())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(HandshakeStatus::FailRelayFull));
        assert_eq!(relay.state().size(), 0);
    }

    #[tokio::test]
    async fn test_pending_circuit_holds_slot() {
        let (dialer, mut opened) = crate::testing::ChannelDialer::new();
        let (relay, _) = Relay::new(
            PeerId::random(),
            Arc::new(dialer),
            None,
            RelayConfig {
                max_relayed_connections: 1,
                ..relay_config()
            },
        );

        let (first, first_remote) = Stream::pair();
        first
            .send(Bytes::copy_from_slice(PeerId::random().as_bytes()))
            .await
            .unwrap();
        relay.handle_relay(PeerId::random(), first_remote).await;

        // The destination is dialed but has not answered yet
        let _pending = tokio::time::timeout(TIMEOUT, opened.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relay.state().size(), 0);

        let (mut second, second_remote) = Stream::pair();
        second
            .send(Bytes::copy_from_slice(PeerId::random().as_bytes()))
            .await
            .unwrap();
        relay.handle_relay(PeerId::random(), second_remote).await;
        let answer = tokio::time::timeout(TIMEOUT, second.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&answer[..], &[HandshakeStatus::FailRelayFull.as_byte()]);
    }

    #[tokio::test]
    async fn test_unreachable_destination() {
        let net = Arc::new(Net::default());
        let (alice, _) = node(&net, relay_config());
        let (relay, _) = node(&net, relay_config());

        let err = alice
            .connect(&relay.local_id(), &PeerId::random())
            .await
            .unwrap_err();
        assert_eq!(
            err.status(),
            Some(HandshakeStatus::FailCouldNotReachCounterparty)
        );
    }

    #[tokio::test]
    async fn test_unknown_relay() {
        let net = Arc::new(Net::default());
        let (alice, _) = node(&net, relay_config());

        let err = alice
            .connect(&PeerId::random(), &PeerId::random())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Core(_)));
    }

    #[tokio::test]
    async fn test_can_relay_answers_and_announces() {
        let announcer = Arc::new(RecordingAnnouncer::default());
        let (relay, _) = Relay::new(
            PeerId::random(),
            Arc::new(NetDialer {
                local: PeerId::random(),
                net: Arc::new(Net::default()),
            }),
            Some(announcer.clone() as Arc<dyn Announcer>),
            relay_config(),
        );

        let remote = PeerId::random();
        let (mut local, theirs) = Stream::pair();
        relay.handle_can_relay(remote, theirs).await;

        assert_eq!(
            tokio::time::timeout(TIMEOUT, local.recv()).await.unwrap().unwrap(),
            Bytes::from_static(CAN_RELAY_OK)
        );
        tokio::time::timeout(TIMEOUT, async {
            while announcer.keys.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(announcer.keys.lock().unwrap()[0], relayer_key(&remote));
    }

    #[tokio::test]
    async fn test_connect_with_direct_channel() {
        let net = Arc::new(Net::default());
        let config = RelayConfig {
            prune_interval: None,
            ..RelayConfig::default()
        };
        let (alice, _) = node(&net, config.clone());
        let (relay, _) = node(&net, config.clone());
        let (bob, mut bob_incoming) = node(&net, config);

        let to_bob = alice.connect(&relay.local_id(), &bob.local_id()).await.unwrap();
        let mut from_alice = tokio::time::timeout(TIMEOUT, bob_incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(to_bob, RelayedConnection::WebRtc(_)));
        assert!(matches!(from_alice, RelayedConnection::WebRtc(_)));

        to_bob.send(Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(
            tokio::time::timeout(TIMEOUT, from_alice.recv()).await.unwrap().unwrap(),
            Bytes::from_static(b"data")
        );

        // Upgrading frees the relay slot
        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.state().size() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        to_bob.send(Bytes::from_static(b"more")).await.unwrap();
        assert_eq!(
            tokio::time::timeout(TIMEOUT, from_alice.recv()).await.unwrap().unwrap(),
            Bytes::from_static(b"more")
        );
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.max_relayed_connections, 10);
        assert_eq!(config.circuit_timeout, Duration::from_secs(6));
        assert_eq!(config.relay_free_timeout, Duration::ZERO);
        assert!(config.webrtc.is_some());
    }
}
