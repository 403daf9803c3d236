//! Upgrading relayed connections to direct ones.
//!
//! The relay carries the signalling of a [`DirectChannel`]; once the channel
//! is up, [`WebRtcConnection`] moves the traffic over and releases the relay
//! slot.

pub mod channel;
pub mod connection;

pub use channel::{
    DirectChannel, DirectChannelFactory, Role, TcpChannelConfig, TcpChannelFactory,
    TcpDirectChannel, TcpSignal,
};
pub use connection::{DONE, NOT_DONE, WebRtcConnection, WebRtcHandle};

use std::time::Duration;

/// Default time a new connection waits for its direct channel
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(3);

/// Direct channel settings
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// How long to wait for the direct channel before staying on the relay
    pub upgrade_timeout: Duration,
    /// Settings of the bundled TCP channel
    pub channel: TcpChannelConfig,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            channel: TcpChannelConfig::default(),
        }
    }
}
