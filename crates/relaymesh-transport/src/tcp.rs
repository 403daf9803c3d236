//! Plain TCP dialing and connection upgrade.
//!
//! Every dial opens one TCP connection carrying one protocol stream. The
//! connection is framed with 4-byte length prefixes and starts with a hello
//! frame:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ peer id (32 bytes)   │ protocol id (UTF-8)          │
//! └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! The hello is not authenticated. Hosts that need authenticated and
//! encrypted channels plug in their own [`Upgrader`].

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use relaymesh_core::peer::PEER_ID_LEN;
use relaymesh_core::{
    Address, Dialer, Error, InboundStream, PeerId, Protocol, Result, Stream, TransportProtocol,
    Upgrader,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;

/// Default timeout for connecting and for the hello frame
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Known direct addresses of peers
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: Arc<RwLock<HashMap<PeerId, Vec<Address>>>>,
}

impl AddressBook {
    /// Create an empty address book
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses of `peer`, skipping circuit addresses and duplicates
    pub fn add(&self, peer: PeerId, addrs: impl IntoIterator<Item = Address>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let known = entries.entry(peer).or_default();
        for addr in addrs {
            if addr.is_circuit() || known.contains(&addr) {
                continue;
            }
            known.push(addr);
        }
    }

    /// Addresses of `peer` in insertion order
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Vec<Address> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget `peer`
    pub fn remove(&self, peer: &PeerId) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    /// Number of known peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no peer is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode the hello frame
#[must_use]
pub fn encode_hello(local: &PeerId, protocol: Protocol) -> bytes::Bytes {
    let id = protocol.as_str().as_bytes();
    let mut hello = BytesMut::with_capacity(PEER_ID_LEN + id.len());
    hello.put_slice(local.as_bytes());
    hello.put_slice(id);
    hello.freeze()
}

/// Decode a hello frame.
///
/// # Errors
///
/// Returns [`Error::Upgrade`] if the frame is too short, the peer id is not
/// a valid key or the protocol is unknown.
pub fn decode_hello(hello: &[u8]) -> Result<(PeerId, Protocol)> {
    if hello.len() <= PEER_ID_LEN {
        return Err(Error::upgrade(format!("hello of {} bytes is too short", hello.len())));
    }
    let (id, protocol) = hello.split_at(PEER_ID_LEN);
    let peer = PeerId::from_public_key(id)?;
    let protocol = std::str::from_utf8(protocol)
        .map_err(|_| Error::upgrade("protocol id is not UTF-8"))?
        .parse()?;
    Ok((peer, protocol))
}

/// Upgrader exchanging a plain hello frame
#[derive(Debug, Clone)]
pub struct PlainUpgrader {
    local: PeerId,
    timeout: Duration,
}

impl PlainUpgrader {
    /// Upgrader of node `local`
    #[must_use]
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Time allowed for the remote hello
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Upgrader for PlainUpgrader {
    async fn upgrade_inbound(&self, mut raw: Stream, remote_addr: SocketAddr) -> Result<InboundStream> {
        let hello = tokio::time::timeout(self.timeout, raw.recv())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or(Error::StreamClosed)?;
        let (remote_peer, protocol) = decode_hello(&hello)?;
        tracing::trace!("{} from {} at {}", protocol, remote_peer.short(), remote_addr);
        Ok(InboundStream {
            remote_peer,
            protocol,
            stream: raw,
        })
    }

    async fn upgrade_outbound(
        &self,
        raw: Stream,
        _peer: Option<PeerId>,
        protocol: Protocol,
    ) -> Result<Stream> {
        raw.send(encode_hello(&self.local, protocol)).await?;
        Ok(raw)
    }
}

/// Dialer opening one TCP connection per protocol stream
pub struct TcpDialer {
    upgrader: Arc<dyn Upgrader>,
    book: AddressBook,
    connect_timeout: Duration,
}

impl std::fmt::Debug for TcpDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDialer")
            .field("peers", &self.book.len())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TcpDialer {
    /// Dialer upgrading with `upgrader` and resolving peers in `book`
    #[must_use]
    pub fn new(upgrader: Arc<dyn Upgrader>, book: AddressBook) -> Self {
        Self {
            upgrader,
            book,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Connect timeout per address
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The address book used by [`Dialer::dial_peer`]
    #[must_use]
    pub fn address_book(&self) -> &AddressBook {
        &self.book
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &Address, protocol: Protocol) -> Result<Stream> {
        if addr.is_circuit() {
            return Err(Error::dial(format!(
                "{} must be dialed through the relay service",
                addr
            )));
        }
        let target = match (addr.socket_addr(), addr.transport()) {
            (Some(target), Some(TransportProtocol::Tcp)) => target,
            _ => return Err(Error::dial(format!("{} is not a TCP address", addr))),
        };

        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| Error::dial(format!("connecting to {} timed out", target)))??;
        socket.set_nodelay(true)?;

        let (stream, _task) = Stream::framed(socket);
        self.upgrader
            .upgrade_outbound(stream, addr.peer_id(), protocol)
            .await
    }

    async fn dial_peer(&self, peer: &PeerId, protocol: Protocol) -> Result<Stream> {
        let addrs = self.book.get(peer);
        if addrs.is_empty() {
            return Err(Error::dial(format!("no known address of {}", peer.short())));
        }

        let mut last_error = None;
        for addr in addrs {
            match self.dial(&addr.with_peer(*peer), protocol).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!("dialing {} at {} failed: {}", peer.short(), addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::dial("no address left")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[test]
    fn test_hello_roundtrip() {
        let peer = PeerId::random();
        let hello = encode_hello(&peer, Protocol::Delivery);
        assert_eq!(decode_hello(&hello).unwrap(), (peer, Protocol::Delivery));
    }

    #[test]
    fn test_hello_rejects_garbage() {
        assert!(decode_hello(&[0u8; 10]).is_err());

        let mut hello = PeerId::random().as_bytes().to_vec();
        hello.extend_from_slice(b"/unknown/1.0.0");
        assert!(decode_hello(&hello).is_err());
    }

    #[test]
    fn test_address_book() {
        let book = AddressBook::new();
        let peer = PeerId::random();
        let tcp = Address::tcp("127.0.0.1:9091".parse().unwrap());
        book.add(
            peer,
            [tcp, tcp, Address::circuit(PeerId::random(), peer)],
        );
        assert_eq!(book.get(&peer), vec![tcp]);
        assert_eq!(book.len(), 1);

        book.remove(&peer);
        assert!(book.is_empty());
    }

    #[tokio::test]
    async fn test_dial_and_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server, client) = (PeerId::random(), PeerId::random());
        let book = AddressBook::new();
        book.add(server, [Address::tcp(addr)]);
        let dialer = TcpDialer::new(Arc::new(PlainUpgrader::new(client)), book);

        let accept = tokio::spawn(async move {
            let (socket, remote) = listener.accept().await.unwrap();
            let (stream, _task) = Stream::framed(socket);
            PlainUpgrader::new(server)
                .upgrade_inbound(stream, remote)
                .await
                .unwrap()
        });

        let outbound = dialer.dial_peer(&server, Protocol::Relay).await.unwrap();
        let mut inbound = accept.await.unwrap();
        assert_eq!(inbound.remote_peer, client);
        assert_eq!(inbound.protocol, Protocol::Relay);

        outbound.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(
            inbound.stream.recv().await.unwrap(),
            Bytes::from_static(b"ping")
        );
    }

    #[tokio::test]
    async fn test_dial_unknown_peer() {
        let dialer = TcpDialer::new(
            Arc::new(PlainUpgrader::new(PeerId::random())),
            AddressBook::new(),
        );
        assert!(dialer.dial_peer(&PeerId::random(), Protocol::Relay).await.is_err());
        assert!(
            dialer
                .dial(&Address::circuit(PeerId::random(), PeerId::random()), Protocol::Relay)
                .await
                .is_err()
        );
    }
}
