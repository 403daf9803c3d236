//! # relaymesh core
//!
//! Shared building blocks for the relaymesh NAT-traversal transport.
//!
//! This crate provides:
//! - Peer identities ([`PeerId`]) and unordered pair keys ([`PairKey`])
//! - Direct and relay-circuit addresses ([`Address`])
//! - The chunked duplex [`Stream`] every other component is built on
//! - Length-prefixed framing for byte-oriented channels
//! - Collaborator traits consumed from the outer peer-to-peer stack
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 relaymesh-transport (Listener)               │
//! ├───────────────────────────────┬──────────────────────────────┤
//! │   relaymesh-discovery         │   relaymesh-relay            │
//! │   (STUN, entry nodes)         │   (handshake, circuits,      │
//! │                               │    direct-channel upgrade)   │
//! ├───────────────────────────────┴──────────────────────────────┤
//! │   relaymesh-core (PeerId, Address, Stream, traits)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod error;
pub mod peer;
pub mod stream;
pub mod transport;

pub use address::{Address, TransportProtocol};
pub use error::{Error, Result};
pub use peer::{PairKey, PeerId};
pub use stream::{ChunkSink, ChunkSource, Stream, StreamTask};
pub use transport::{
    AddressFilter, Announcer, CAN_RELAY_OK, Dialer, InboundStream, Protocol, Upgrader, UsableAddressFilter,
};

/// Returns a short random hex tag used to tell instances apart in log output.
#[must_use]
pub fn instance_tag() -> String {
    use rand_core::RngCore;

    let mut tag = [0u8; 4];
    rand_core::OsRng.fill_bytes(&mut tag);
    hex::encode(tag)
}
