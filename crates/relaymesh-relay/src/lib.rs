//! # relaymesh relay
//!
//! Relayed circuits for nodes that cannot reach each other directly.
//!
//! This crate provides:
//! - The one-byte-prefix sub-protocol spoken over every circuit
//! - The three-party handshake between initiator, relay and destination
//! - The relay-side registry of circuits and the per-leg byte pumps
//! - The endpoint-side connection with reconnect handling
//! - The upgrade of a relayed connection to a direct channel
//!
//! ## Circuit
//!
//! ```text
//! initiator ──► RelayConnection ══ leg A ══► RelayContext ─┐
//!                                                          │ RelayState
//! destination ◄── RelayConnection ══ leg B ══ RelayContext ◄┘
//! ```
//!
//! [`Relay`] ties the pieces together and serves the `relay`, `delivery`
//! and `can-relay` protocols.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod context;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod relay;
pub mod state;
pub mod webrtc;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionOptions, RelayConnection, RelayConnectionHandle, Timeline};
pub use context::{LegStatus, RelayContext};
pub use error::{HandshakeStatus, RelayError, Result};
pub use handshake::RelayHandshake;
pub use protocol::{Frame, StatusQueue};
pub use relay::{Relay, RelayConfig, RelayedConnection, relayer_key};
pub use state::{RelayState, SlotReservation};
pub use webrtc::{DirectChannel, DirectChannelFactory, WebRtcConfig, WebRtcConnection};
