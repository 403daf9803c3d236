//! Collaborator traits consumed from the outer peer-to-peer stack.
//!
//! relaymesh does not negotiate protocols or encrypt channels itself. It
//! relies on a host stack that can dial addresses, open protocol streams to
//! known peers, upgrade raw connections, judge address usability and announce
//! keys in a DHT. These seams are expressed as the traits below so any stack
//! (or the in-memory test network) can be plugged in.

use crate::address::{Address, TransportProtocol};
use crate::error::{Error, Result};
use crate::peer::PeerId;
use crate::stream::Stream;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Protocols spoken on relaymesh streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Initiator asks a relay for a circuit
    Relay,
    /// Relay delivers a circuit to its destination
    Delivery,
    /// Probe whether a node is willing to relay
    CanRelay,
}

impl Protocol {
    /// Protocol identifier on the wire
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relay => "/relaymesh/relay/1.0.0",
            Self::Delivery => "/relaymesh/delivery/1.0.0",
            Self::CanRelay => "/relaymesh/can-relay/1.0.0",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [Self::Relay, Self::Delivery, Self::CanRelay]
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::UnknownProtocol(s.to_string()))
    }
}

/// Answer of a node willing to relay, sent on a can-relay stream
pub const CAN_RELAY_OK: &[u8] = b"OK";

/// A protocol stream opened by a remote peer
#[derive(Debug)]
pub struct InboundStream {
    /// Authenticated identity of the remote peer
    pub remote_peer: PeerId,
    /// Negotiated protocol
    pub protocol: Protocol,
    /// The stream itself
    pub stream: Stream,
}

/// Opens protocol streams to remote nodes
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `addr` directly and open a `protocol` stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be reached or the protocol is
    /// refused.
    async fn dial(&self, addr: &Address, protocol: Protocol) -> Result<Stream>;

    /// Open a `protocol` stream to `peer`, reusing an existing connection
    /// when there is one and otherwise dialing its known direct addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable connection to `peer` can be obtained.
    async fn dial_peer(&self, peer: &PeerId, protocol: Protocol) -> Result<Stream>;
}

/// Turns raw connections into authenticated protocol streams
#[async_trait]
pub trait Upgrader: Send + Sync {
    /// Upgrade a connection accepted by the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote end fails to identify itself.
    async fn upgrade_inbound(&self, raw: Stream, remote_addr: SocketAddr) -> Result<InboundStream>;

    /// Upgrade a freshly dialed connection towards `peer` (if known).
    ///
    /// # Errors
    ///
    /// Returns an error if the upgrade exchange fails.
    async fn upgrade_outbound(
        &self,
        raw: Stream,
        peer: Option<PeerId>,
        protocol: Protocol,
    ) -> Result<Stream>;
}

/// Usability predicate over addresses
pub trait AddressFilter: Send + Sync {
    /// Keep only the addresses this node can use
    fn filter(&self, addrs: &[Address]) -> Vec<Address>;
}

/// Best-effort DHT announcements
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Announce that this node provides `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the announcement could not be published. Callers
    /// log and ignore it.
    async fn announce(&self, key: [u8; 32]) -> Result<()>;
}

/// Accepts direct IPv4/IPv6 addresses over TCP or UDP
#[derive(Debug, Clone, Copy, Default)]
pub struct UsableAddressFilter;

impl AddressFilter for UsableAddressFilter {
    fn filter(&self, addrs: &[Address]) -> Vec<Address> {
        addrs
            .iter()
            .filter(|addr| {
                matches!(
                    addr.transport(),
                    Some(TransportProtocol::Tcp | TransportProtocol::Udp)
                )
            })
            .copied()
            .collect()
    }
}
