//! Helpers shared by the relaymesh integration tests.

use relaymesh_core::PeerId;
use relaymesh_discovery::nat::{StunMessage, StunMessageClass};
use relaymesh_relay::{Relay, RelayConfig, RelayedConnection};
use relaymesh_transport::MemoryNetwork;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default timeout for awaiting events in tests
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A relay service attached to a [`MemoryNetwork`]
pub struct MeshNode {
    /// Node identity
    pub id: PeerId,
    /// The node's relay service
    pub relay: Relay,
    /// Incoming relayed connections
    pub incoming: mpsc::UnboundedReceiver<RelayedConnection>,
    accept: JoinHandle<()>,
}

impl MeshNode {
    /// Register a new node on `network`; streams opened to it are
    /// dispatched to its relay service
    pub fn spawn(network: &MemoryNetwork, config: RelayConfig) -> Self {
        let id = PeerId::random();
        let mut inbound = network.register(id);
        let (relay, incoming) = Relay::new(id, Arc::new(network.dialer(id)), None, config);

        let service = relay.clone();
        let accept = tokio::spawn(async move {
            while let Some(stream) = inbound.recv().await {
                let service = service.clone();
                tokio::spawn(async move { service.dispatch(stream).await });
            }
        });

        Self {
            id,
            relay,
            incoming,
            accept,
        }
    }

    /// Wait for the next incoming relayed connection
    ///
    /// # Panics
    ///
    /// Panics if none arrives within [`TIMEOUT`].
    pub async fn next_incoming(&mut self) -> RelayedConnection {
        tokio::time::timeout(TIMEOUT, self.incoming.recv())
            .await
            .expect("timed out waiting for a relayed connection")
            .expect("relay service stopped")
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Relay settings without background pruning and direct channel upgrade
#[must_use]
pub fn relay_only_config() -> RelayConfig {
    RelayConfig {
        prune_interval: None,
        webrtc: None,
        ..RelayConfig::default()
    }
}

/// Poll `condition` until it holds.
///
/// # Panics
///
/// Panics if it does not hold within `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// STUN server answering every binding request with a fixed mapped
/// address
pub struct StunResponder {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StunResponder {
    /// Bind on localhost and report `reported` to every client
    ///
    /// # Panics
    ///
    /// Panics if the socket cannot be bound.
    pub async fn spawn(reported: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("bind STUN responder");
        let addr = socket.local_addr().expect("responder address");

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(request) = StunMessage::decode(&buf[..len]) else {
                    continue;
                };
                if request.message_class != StunMessageClass::Request {
                    continue;
                }
                let response = StunMessage::binding_response(request.transaction_id, reported);
                let _ = socket.send_to(&response.encode(), from).await;
            }
        });

        Self { addr, task }
    }

    /// Address clients send requests to
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for StunResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
