//! Endpoint addresses.
//!
//! Addresses use a multiaddr-like text form:
//!
//! ```text
//! /ip4/203.0.113.7/tcp/9091
//! /ip6/2001:db8::1/udp/9091/p2p/<peer-id>
//! /p2p/<relay-id>/p2p-circuit/p2p/<destination-id>
//! ```

use crate::error::{Error, Result};
use crate::peer::PeerId;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Transport protocol of a direct address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl TransportProtocol {
    fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Directly dialable socket address
    Direct {
        /// Host address
        ip: IpAddr,
        /// Port number
        port: u16,
        /// Transport protocol
        transport: TransportProtocol,
        /// Identity of the node listening there, if known
        peer: Option<PeerId>,
    },
    /// Relay circuit `relay -> destination`
    Circuit {
        /// Relay forwarding the traffic
        relay: PeerId,
        /// Node reachable through the relay
        destination: PeerId,
    },
}

impl Address {
    /// TCP address
    #[must_use]
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::Direct {
            ip: addr.ip(),
            port: addr.port(),
            transport: TransportProtocol::Tcp,
            peer: None,
        }
    }

    /// UDP address
    #[must_use]
    pub fn udp(addr: SocketAddr) -> Self {
        Self::Direct {
            ip: addr.ip(),
            port: addr.port(),
            transport: TransportProtocol::Udp,
            peer: None,
        }
    }

    /// Relay circuit address `/p2p/<relay>/p2p-circuit/p2p/<destination>`
    #[must_use]
    pub fn circuit(relay: PeerId, destination: PeerId) -> Self {
        Self::Circuit { relay, destination }
    }

    /// Attach a peer identity to a direct address
    #[must_use]
    pub fn with_peer(self, id: PeerId) -> Self {
        match self {
            Self::Direct {
                ip,
                port,
                transport,
                ..
            } => Self::Direct {
                ip,
                port,
                transport,
                peer: Some(id),
            },
            circuit => circuit,
        }
    }

    /// Socket address of a direct address
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Direct { ip, port, .. } => Some(SocketAddr::new(*ip, *port)),
            Self::Circuit { .. } => None,
        }
    }

    /// Identity of the node this address leads to
    #[must_use]
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            Self::Direct { peer, .. } => *peer,
            Self::Circuit { destination, .. } => Some(*destination),
        }
    }

    /// Relay of a circuit address
    #[must_use]
    pub fn relay(&self) -> Option<PeerId> {
        match self {
            Self::Circuit { relay, .. } => Some(*relay),
            Self::Direct { .. } => None,
        }
    }

    /// Transport protocol of a direct address
    #[must_use]
    pub fn transport(&self) -> Option<TransportProtocol> {
        match self {
            Self::Direct { transport, .. } => Some(*transport),
            Self::Circuit { .. } => None,
        }
    }

    /// Whether this is a relay circuit address
    #[must_use]
    pub fn is_circuit(&self) -> bool {
        matches!(self, Self::Circuit { .. })
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::tcp(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct {
                ip,
                port,
                transport,
                peer,
            } => {
                let family = if ip.is_ipv4() { "ip4" } else { "ip6" };
                write!(f, "/{}/{}/{}/{}", family, ip, transport.as_str(), port)?;
                if let Some(peer) = peer {
                    write!(f, "/p2p/{}", peer)?;
                }
                Ok(())
            }
            Self::Circuit { relay, destination } => {
                write!(f, "/p2p/{}/p2p-circuit/p2p/{}", relay, destination)
            }
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &'static str| Error::InvalidAddress {
            addr: s.to_string(),
            reason: reason.into(),
        };

        let mut parts = s.split('/');
        if parts.next() != Some("") {
            return Err(invalid("must start with '/'"));
        }

        let parts: Vec<&str> = parts.collect();
        match parts.as_slice() {
            ["p2p", relay, "p2p-circuit", "p2p", destination] => {
                let relay = relay.parse().map_err(|_| invalid("invalid relay id"))?;
                let destination = destination
                    .parse()
                    .map_err(|_| invalid("invalid destination id"))?;
                Ok(Self::Circuit { relay, destination })
            }
            [family, host, transport, port, rest @ ..] => {
                let ip: IpAddr = host.parse().map_err(|_| invalid("invalid host"))?;
                match (*family, ip) {
                    ("ip4", IpAddr::V4(_)) | ("ip6", IpAddr::V6(_)) => {}
                    _ => return Err(invalid("address family does not match host")),
                }

                let transport = match *transport {
                    "tcp" => TransportProtocol::Tcp,
                    "udp" => TransportProtocol::Udp,
                    _ => return Err(invalid("unsupported transport")),
                };

                let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

                let peer = match rest {
                    [] => None,
                    ["p2p", id] => Some(id.parse().map_err(|_| invalid("invalid peer id"))?),
                    _ => return Err(invalid("unexpected trailing components")),
                };

                Ok(Self::Direct {
                    ip,
                    port,
                    transport,
                    peer,
                })
            }
            _ => Err(invalid("unrecognized format")),
        }
    }
}
