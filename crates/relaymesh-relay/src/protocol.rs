//! Relay sub-protocol.
//!
//! Every chunk travelling over a relayed circuit starts with a one-byte
//! prefix:
//!
//! | Prefix | Value | Sub-types |
//! |--------|-------|-----------|
//! | `PAYLOAD` | `0x00` | application bytes follow |
//! | `STATUS_MESSAGE` | `0x01` | `PING = 0x00`, `PONG = 0x01` |
//! | `CONNECTION_STATUS` | `0x02` | `STOP = 0x00`, `RESTART = 0x01`, `UPGRADED = 0x02` |
//! | `WEBRTC_SIGNALLING` | `0x03` | JSON signalling message follows |
//!
//! Control messages are queued in a [`StatusQueue`] which hands them out by
//! rank: `CONNECTION_STATUS` before `STATUS_MESSAGE` before
//! `WEBRTC_SIGNALLING` before `PAYLOAD`, FIFO within one rank.

use crate::error::{RelayError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Application payload
pub const PAYLOAD: u8 = 0x00;
/// Liveness messages
pub const STATUS_MESSAGE: u8 = 0x01;
/// Connection lifecycle messages
pub const CONNECTION_STATUS: u8 = 0x02;
/// Direct-channel signalling
pub const WEBRTC_SIGNALLING: u8 = 0x03;

/// `STATUS_MESSAGE` sub-type: liveness probe
pub const PING: u8 = 0x00;
/// `STATUS_MESSAGE` sub-type: probe answer
pub const PONG: u8 = 0x01;

/// `CONNECTION_STATUS` sub-type: circuit is done, no reconnects
pub const STOP: u8 = 0x00;
/// `CONNECTION_STATUS` sub-type: the other end reconnected
pub const RESTART: u8 = 0x01;
/// `CONNECTION_STATUS` sub-type: traffic moved to a direct channel
pub const UPGRADED: u8 = 0x02;

/// Optional nonce carried by `PING` and echoed by `PONG`
pub type PingNonce = [u8; 4];

/// Decoded sub-protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application bytes, prefix stripped
    Payload(Bytes),
    /// Liveness probe
    Ping(Option<PingNonce>),
    /// Probe answer
    Pong(Option<PingNonce>),
    /// Close the circuit
    Stop,
    /// The other end reconnected
    Restart,
    /// The other end moved to a direct channel
    Upgraded,
    /// JSON signalling message, prefix stripped
    Signalling(Bytes),
}

impl Frame {
    /// Decode one chunk.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidFrame`] for empty chunks and unknown
    /// prefixes or sub-types.
    pub fn decode(chunk: &Bytes) -> Result<Self> {
        let Some(&prefix) = chunk.first() else {
            return Err(RelayError::InvalidFrame("empty chunk".to_string()));
        };

        match prefix {
            PAYLOAD => Ok(Self::Payload(chunk.slice(1..))),
            WEBRTC_SIGNALLING => Ok(Self::Signalling(chunk.slice(1..))),
            STATUS_MESSAGE => {
                let nonce = decode_nonce(&chunk[1..]);
                match chunk.get(1) {
                    Some(&PING) => Ok(Self::Ping(nonce)),
                    Some(&PONG) => Ok(Self::Pong(nonce)),
                    other => Err(RelayError::InvalidFrame(format!(
                        "invalid status message {:?}",
                        other
                    ))),
                }
            }
            CONNECTION_STATUS => match chunk.get(1) {
                Some(&STOP) => Ok(Self::Stop),
                Some(&RESTART) => Ok(Self::Restart),
                Some(&UPGRADED) => Ok(Self::Upgraded),
                other => Err(RelayError::InvalidFrame(format!(
                    "invalid connection status {:?}",
                    other
                ))),
            },
            other => Err(RelayError::InvalidFrame(format!(
                "invalid prefix 0x{:02x}",
                other
            ))),
        }
    }

    /// Wire representation including the prefix
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Payload(body) => prefixed(PAYLOAD, body),
            Self::Signalling(body) => prefixed(WEBRTC_SIGNALLING, body),
            Self::Ping(nonce) => status(PING, nonce.as_ref()),
            Self::Pong(nonce) => status(PONG, nonce.as_ref()),
            Self::Stop => Bytes::from_static(&[CONNECTION_STATUS, STOP]),
            Self::Restart => Bytes::from_static(&[CONNECTION_STATUS, RESTART]),
            Self::Upgraded => Bytes::from_static(&[CONNECTION_STATUS, UPGRADED]),
        }
    }

    /// Queue rank, higher leaves first
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Stop | Self::Restart | Self::Upgraded => 3,
            Self::Ping(_) | Self::Pong(_) => 2,
            Self::Signalling(_) => 1,
            Self::Payload(_) => 0,
        }
    }

    /// Whether this is a `STOP`
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

fn prefixed(prefix: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(prefix);
    buf.put_slice(body);
    buf.freeze()
}

fn status(kind: u8, nonce: Option<&PingNonce>) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(STATUS_MESSAGE);
    buf.put_u8(kind);
    if let Some(nonce) = nonce {
        buf.put_slice(nonce);
    }
    buf.freeze()
}

fn decode_nonce(rest: &[u8]) -> Option<PingNonce> {
    rest.get(1..5).and_then(|n| n.try_into().ok())
}

#[derive(Debug)]
struct Queued {
    rank: u8,
    seq: u64,
    frame: Frame,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher rank first, then lower sequence number first
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<Queued>,
    seq: u64,
}

/// Priority queue for outgoing control messages.
///
/// Pushing wakes one waiter of [`StatusQueue::next`]. Popping a `STOP`
/// discards everything still queued.
#[derive(Debug, Default)]
pub struct StatusQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl StatusQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message
    pub fn push(&self, frame: Frame) {
        {
            let mut inner = self.lock();
            let seq = inner.seq;
            inner.seq += 1;
            inner.heap.push(Queued {
                rank: frame.rank(),
                seq,
                frame,
            });
        }
        self.notify.notify_one();
    }

    /// Take the highest-ranked message, if any
    pub fn pop(&self) -> Option<Frame> {
        let mut inner = self.lock();
        let frame = inner.heap.pop()?.frame;
        if frame.is_stop() {
            inner.heap.clear();
        }
        Some(frame)
    }

    /// Wait for the next message.
    ///
    /// Cancel safe: a message is only removed from the queue when this
    /// future completes.
    pub async fn next(&self) -> Frame {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.pop() {
                return frame;
            }
            notified.await;
        }
    }

    /// Number of queued messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all queued messages
    pub fn clear(&self) {
        self.lock().heap.clear();
    }
}
