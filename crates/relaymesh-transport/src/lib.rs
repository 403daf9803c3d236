//! # relaymesh transport
//!
//! Socket layer of relaymesh.
//!
//! This crate provides:
//! - A listener binding TCP and UDP on one port, answering STUN and
//!   advertising external, circuit and interface addresses
//! - A plain TCP [`Dialer`](relaymesh_core::Dialer) with a hello-frame
//!   [`Upgrader`](relaymesh_core::Upgrader)
//! - An in-process network for tests and simulations
//! - A [`Node`] facade running listener, entry nodes and relay service
//!
//! ## Example
//!
//! ```no_run
//! use relaymesh_core::PeerId;
//! use relaymesh_transport::{Node, NodeConfig, NodeEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (node, mut events) = Node::new(PeerId::random(), NodeConfig::default(), None);
//! node.listen("0.0.0.0:9091".parse()?, None).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let NodeEvent::Connection(mut conn) = event {
//!         while let Some(chunk) = conn.recv().await {
//!             println!("{} bytes from {}", chunk.len(), conn.counterparty());
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod listener;
pub mod memory;
pub mod node;
pub mod tcp;

pub use error::{Result, TransportError};
pub use listener::{Listener, ListenerConfig, ListenerEvent};
pub use memory::{MemoryAnnouncer, MemoryDialer, MemoryNetwork};
pub use node::{Node, NodeConfig, NodeEvent};
pub use tcp::{AddressBook, PlainUpgrader, TcpDialer};
