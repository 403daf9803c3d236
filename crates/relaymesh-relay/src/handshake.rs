//! Three-party relay handshake.
//!
//! ```text
//! initiator                    relay                       destination
//!     │── destination key ──────►│                               │
//!     │                          │── dial (delivery protocol) ──►│
//!     │                          │── initiator key ─────────────►│
//!     │                          │◄──────────────────────── OK ──│
//!     │◄───────────────────── OK ─│                               │
//!     │◄═════════════ relayed traffic (RelayState) ═════════════►│
//! ```
//!
//! Every answer is a single [`HandshakeStatus`] byte. Failures are final:
//! they are reported to the caller and never retried.

use crate::context::DEFAULT_PING_TIMEOUT;
use crate::error::{HandshakeStatus, RelayError, Result};
use crate::state::{RelayState, SlotReservation};
use bytes::Bytes;
use relaymesh_core::{Dialer, PeerId, Protocol, Stream};
use std::time::Duration;

/// One side of a relay handshake over a freshly opened stream
#[derive(Debug)]
pub struct RelayHandshake {
    stream: Stream,
    slot: Option<SlotReservation>,
}

impl RelayHandshake {
    /// Wrap a stream on which the handshake has not started yet
    #[must_use]
    pub fn new(stream: Stream) -> Self {
        Self { stream, slot: None }
    }

    /// Hold `slot` until the negotiated circuit is stored
    #[must_use]
    pub fn with_slot(mut self, slot: SlotReservation) -> Self {
        self.slot = Some(slot);
        self
    }

    async fn answer(&self, status: HandshakeStatus) -> Result<()> {
        self.stream
            .send(Bytes::copy_from_slice(&[status.as_byte()]))
            .await
            .map_err(RelayError::from)
    }

    /// Answer with a failure code and end the stream
    pub async fn reject(self, status: HandshakeStatus) {
        if let Err(e) = self.answer(status).await {
            tracing::debug!("could not deliver {}: {}", status, e);
        }
    }

    async fn fail<T>(self, status: HandshakeStatus) -> Result<T> {
        self.reject(status).await;
        Err(RelayError::Handshake(status))
    }

    /// Initiator side: ask `relay` for a circuit to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Handshake`] with the relay's answer if it is not
    /// `OK`, or [`RelayError::NoAnswer`] if the relay closed the stream.
    pub async fn initiate(mut self, relay: &PeerId, destination: &PeerId) -> Result<Stream> {
        tracing::debug!(
            "asking relay {} for circuit to {}",
            relay.short(),
            destination.short()
        );
        self.stream
            .send(Bytes::copy_from_slice(destination.as_bytes()))
            .await?;

        let answer = self.stream.recv().await.ok_or(RelayError::NoAnswer)?;
        let status = match answer.first() {
            Some(&byte) => HandshakeStatus::try_from(byte)?,
            None => return Err(RelayError::NoAnswer),
        };

        match status {
            HandshakeStatus::Ok => Ok(self.stream),
            failure => {
                tracing::debug!(
                    "relay {} refused circuit to {}: {}",
                    relay.short(),
                    destination.short(),
                    failure
                );
                Err(RelayError::Handshake(failure))
            }
        }
    }

    /// Relay side: read the destination, reach it and wire both streams
    /// into `state`.
    ///
    /// If a live circuit between the two peers already exists, the new
    /// stream replaces the initiator's leg instead. Otherwise this resolves
    /// once the new circuit ended.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Handshake`] with the code sent to the initiator
    /// if the circuit could not be established.
    pub async fn negotiate(
        mut self,
        source: PeerId,
        local_id: PeerId,
        dialer: &dyn Dialer,
        state: &RelayState,
        dial_timeout: Duration,
    ) -> Result<()> {
        let Some(chunk) = self.stream.recv().await else {
            return Err(RelayError::NoAnswer);
        };

        if chunk.is_empty() {
            tracing::debug!("{} sent an empty destination", source.short());
            return self.fail(HandshakeStatus::FailInvalidPublicKey).await;
        }

        let destination = match PeerId::from_public_key(&chunk) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!("{} sent an invalid destination: {}", source.short(), e);
                return self.fail(HandshakeStatus::FailInvalidPublicKey).await;
            }
        };

        if destination == source || destination == local_id {
            tracing::debug!("{} asked for a loopback circuit", source.short());
            return self.fail(HandshakeStatus::FailLoopbacksAreNotAllowed).await;
        }

        if state.exists(source, destination)
            && state
                .is_active(source, destination, DEFAULT_PING_TIMEOUT)
                .await
        {
            tracing::debug!(
                "reusing circuit {} -> {}",
                source.short(),
                destination.short()
            );
            self.answer(HandshakeStatus::Ok).await?;
            if state.update_existing(source, destination, self.stream) {
                return Ok(());
            }
            return Err(RelayError::StreamClosed);
        }

        let mut to_destination =
            match tokio::time::timeout(dial_timeout, dialer.dial_peer(&destination, Protocol::Delivery))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!("could not dial {}: {}", destination.short(), e);
                    return self.fail(HandshakeStatus::FailCouldNotReachCounterparty).await;
                }
                Err(_) => {
                    tracing::debug!("dialing {} timed out", destination.short());
                    return self.fail(HandshakeStatus::FailCouldNotReachCounterparty).await;
                }
            };

        if !deliver(&to_destination, &source, dial_timeout).await
            || !expect_ok(&mut to_destination, dial_timeout).await
        {
            tracing::debug!("{} did not accept the circuit", destination.short());
            return self.fail(HandshakeStatus::FailCouldNotReachCounterparty).await;
        }

        self.answer(HandshakeStatus::Ok).await?;
        match self.slot {
            Some(slot) => {
                state
                    .create_reserved(slot, source, destination, self.stream, to_destination)
                    .await
            }
            None => {
                state
                    .create_new(source, destination, self.stream, to_destination)
                    .await
            }
        }
    }

    /// Destination side: read the initiator's identity and accept.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Handshake`] if the identity is not a valid key.
    pub async fn handle(mut self) -> Result<(Stream, PeerId)> {
        let Some(chunk) = self.stream.recv().await else {
            return Err(RelayError::NoAnswer);
        };

        match PeerId::from_public_key(&chunk) {
            Ok(initiator) => {
                self.answer(HandshakeStatus::Ok).await?;
                Ok((self.stream, initiator))
            }
            Err(e) => {
                tracing::debug!("relayed connection with invalid initiator: {}", e);
                self.reject(HandshakeStatus::Fail).await;
                Err(RelayError::Handshake(HandshakeStatus::FailInvalidPublicKey))
            }
        }
    }
}

async fn deliver(stream: &Stream, source: &PeerId, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, stream.send(Bytes::copy_from_slice(source.as_bytes()))).await,
        Ok(Ok(()))
    )
}

async fn expect_ok(stream: &mut Stream, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, stream.recv()).await {
        Ok(Some(answer)) => answer.first() == Some(&HandshakeStatus::Ok.as_byte()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, PAYLOAD};
    use crate::testing::ChannelDialer;

    const TIMEOUT: Duration = Duration::from_secs(1);

    async fn recv(stream: &mut Stream) -> Bytes {
        tokio::time::timeout(TIMEOUT, stream.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_initiate_ok_and_failure() {
        let dest = PeerId::random();
        let relay = PeerId::random();

        let (initiator, mut relay_end) = Stream::pair();
        let task = tokio::spawn(async move {
            RelayHandshake::new(initiator).initiate(&relay, &dest).await
        });
        assert_eq!(&recv(&mut relay_end).await[..], dest.as_bytes());
        relay_end.send(vec![0u8]).await.unwrap();
        assert!(task.await.unwrap().is_ok());

        let (initiator, mut relay_end) = Stream::pair();
        let task = tokio::spawn(async move {
            RelayHandshake::new(initiator).initiate(&relay, &dest).await
        });
        recv(&mut relay_end).await;
        relay_end
            .send(vec![HandshakeStatus::FailRelayFull.as_byte()])
            .await
            .unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(RelayError::Handshake(HandshakeStatus::FailRelayFull))
        ));

        let (initiator, mut relay_end) = Stream::pair();
        let task = tokio::spawn(async move {
            RelayHandshake::new(initiator).initiate(&relay, &dest).await
        });
        recv(&mut relay_end).await;
        drop(relay_end);
        assert!(matches!(task.await.unwrap(), Err(RelayError::NoAnswer)));
    }

    #[tokio::test]
    async fn test_handle_accepts_valid_key() {
        let initiator = PeerId::random();
        let (relay_end, destination) = Stream::pair();
        relay_end
            .send(Bytes::copy_from_slice(initiator.as_bytes()))
            .await
            .unwrap();

        let (_stream, id) = RelayHandshake::new(destination).handle().await.unwrap();
        assert_eq!(id, initiator);
    }

    #[tokio::test]
    async fn test_handle_rejects_garbage() {
        let (mut relay_end, destination) = Stream::pair();
        relay_end.send(vec![1u8, 2, 3]).await.unwrap();

        assert!(RelayHandshake::new(destination).handle().await.is_err());
        assert_eq!(
            &recv(&mut relay_end).await[..],
            &[HandshakeStatus::Fail.as_byte()]
        );
    }

    async fn negotiate_with(
        dest_key: Vec<u8>,
        source: PeerId,
        local: PeerId,
        dialer: &ChannelDialer,
    ) -> (Result<()>, Bytes) {
        let (mut initiator, relay_end) = Stream::pair();
        initiator.send(dest_key).await.unwrap();
        let state = RelayState::default();
        let result = RelayHandshake::new(relay_end)
            .negotiate(source, local, dialer, &state, TIMEOUT)
            .await;
        let answer = recv(&mut initiator).await;
        (result, answer)
    }

    #[tokio::test]
    async fn test_negotiate_rejections() {
        let (dialer, _inbound) = ChannelDialer::new();
        let source = PeerId::random();
        let local = PeerId::random();

        let (result, answer) = negotiate_with(Vec::new(), source, local, &dialer).await;
        assert!(result.is_err());
        assert_eq!(&answer[..], &[HandshakeStatus::FailInvalidPublicKey.as_byte()]);

        let (_, answer) = negotiate_with(vec![7u8; 5], source, local, &dialer).await;
        assert_eq!(&answer[..], &[HandshakeStatus::FailInvalidPublicKey.as_byte()]);

        let (_, answer) = negotiate_with(source.as_bytes().to_vec(), source, local, &dialer).await;
        assert_eq!(
            &answer[..],
            &[HandshakeStatus::FailLoopbacksAreNotAllowed.as_byte()]
        );

        let (_, answer) = negotiate_with(local.as_bytes().to_vec(), source, local, &dialer).await;
        assert_eq!(
            &answer[..],
            &[HandshakeStatus::FailLoopbacksAreNotAllowed.as_byte()]
        );
    }

    #[tokio::test]
    async fn test_negotiate_unreachable_destination() {
        let dialer = ChannelDialer::unreachable();
        let (result, answer) = negotiate_with(
            PeerId::random().as_bytes().to_vec(),
            PeerId::random(),
            PeerId::random(),
            &dialer,
        )
        .await;

        assert!(matches!(
            result,
            Err(RelayError::Handshake(
                HandshakeStatus::FailCouldNotReachCounterparty
            ))
        ));
        assert_eq!(
            &answer[..],
            &[HandshakeStatus::FailCouldNotReachCounterparty.as_byte()]
        );
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let (dialer, mut inbound) = ChannelDialer::new();
        let state = RelayState::default();
        let source = PeerId::random();
        let destination = PeerId::random();
        let relay = PeerId::random();

        let (initiator_end, relay_end) = Stream::pair();
        let relay_task = {
            let state = state.clone();
            tokio::spawn(async move {
                RelayHandshake::new(relay_end)
                    .negotiate(source, relay, &dialer, &state, TIMEOUT)
                    .await
            })
        };

        let destination_task = tokio::spawn(async move {
            let (peer, protocol, stream) = inbound.recv().await.unwrap();
            assert_eq!(peer, destination);
            assert_eq!(protocol, Protocol::Delivery);
            RelayHandshake::new(stream).handle().await.unwrap()
        });

        let mut initiator = RelayHandshake::new(initiator_end)
            .initiate(&relay, &destination)
            .await
            .unwrap();
        let (mut at_destination, initiator_id) = destination_task.await.unwrap();
        assert_eq!(initiator_id, source);
        for _ in 0..100 {
            if state.exists(source, destination) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.exists(source, destination));

        initiator.send(Bytes::from_static(&[PAYLOAD, 1])).await.unwrap();
        assert_eq!(recv(&mut at_destination).await, Bytes::from_static(&[PAYLOAD, 1]));

        initiator.send(Frame::Stop.encode()).await.unwrap();
        let result = tokio::time::timeout(TIMEOUT, relay_task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
