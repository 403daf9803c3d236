//! Test doubles.

use async_trait::async_trait;
use relaymesh_core::{Address, Dialer, Error, PeerId, Protocol, Result, Stream};
use tokio::sync::mpsc;

/// Opened stream as seen by the dialed node
pub(crate) type Dialed = (PeerId, Protocol, Stream);

/// Dialer handing the remote end of every opened stream to the test
pub(crate) struct ChannelDialer {
    opened: Option<mpsc::UnboundedSender<Dialed>>,
}

impl ChannelDialer {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Dialed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { opened: Some(tx) }, rx)
    }

    /// Dialer for which every peer is unreachable
    pub(crate) fn unreachable() -> Self {
        Self { opened: None }
    }
}

#[async_trait]
impl Dialer for ChannelDialer {
    async fn dial(&self, addr: &Address, protocol: Protocol) -> Result<Stream> {
        let peer = addr
            .peer_id()
            .ok_or_else(|| Error::dial(format!("no peer in {}", addr)))?;
        self.dial_peer(&peer, protocol).await
    }

    async fn dial_peer(&self, peer: &PeerId, protocol: Protocol) -> Result<Stream> {
        let opened = self
            .opened
            .as_ref()
            .ok_or_else(|| Error::dial("unreachable"))?;
        let (local, remote) = Stream::pair();
        opened
            .send((*peer, protocol, remote))
            .map_err(|_| Error::dial("test dropped the receiver"))?;
        Ok(local)
    }
}
