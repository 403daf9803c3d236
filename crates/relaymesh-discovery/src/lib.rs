//! # relaymesh discovery
//!
//! Address discovery layer of the relaymesh transport.
//!
//! This crate provides:
//! - STUN binding requests and responses over a shared UDP socket
//! - Local interface enumeration
//! - External address determination with symmetric-NAT detection
//! - Entry node management: probing, ranking and keeping relay connections
//!
//! ## Entry nodes
//!
//! Nodes behind a NAT publish circuit addresses
//! `/p2p/<relay>/p2p-circuit/p2p/<self>` through at most
//! [`entry::MAX_RELAYS_PER_NODE`] entry nodes, chosen by probe latency.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod error;
pub mod nat;

pub use entry::{
    EntryNodeConfig, EntryNodeRecord, EntryNodes, PeerRecord, PublicNodeEvent, RelayChanged,
    UsedRelay,
};
pub use error::{DiscoveryError, Result};
pub use nat::{StunError, StunSocket};
