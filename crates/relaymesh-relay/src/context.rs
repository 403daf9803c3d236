//! Relay-side byte pump for one leg of a circuit.
//!
//! ```text
//!            ┌─────────────── RelayContext (leg A) ───────────────┐
//! party A ──►│ source loop ── PING → PONG, PONG → ping waiters ──►│── relayed ──► leg B sink
//! party A ◄──│ sink loop  ◄── status queue / attached chunks   ◄──│◄─ relayed ─── leg B source
//!            └────────────────────────────────────────────────────┘
//! ```
//!
//! The physical stream of a leg can be swapped with [`RelayContext::update`]
//! when the party reconnects; the source loop then announces `RESTART` to
//! the other leg. A leg is `Open` until it sees `UPGRADED` (traffic moved to
//! a direct channel) and `Closed` once `STOP` passed through it or the
//! circuit broke down.

use crate::error::{RelayError, Result};
use crate::protocol::{CONNECTION_STATUS, Frame, PingNonce, STOP, StatusQueue};
use bytes::Bytes;
use relaymesh_core::stream::DEFAULT_STREAM_CAPACITY;
use relaymesh_core::{ChunkSink, ChunkSource, Stream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

/// Default liveness ping timeout
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(300);

/// How long [`RelayContext::close`] waits for `STOP` to be written
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Lifecycle of a leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegStatus {
    /// Forwarding traffic
    Open,
    /// The party announced `UPGRADED`; the leg still forwards until it ends
    Upgraded,
    /// No further traffic
    Closed,
}

/// A chunk source to drain into the party plus its completion signal
type Attached = (ChunkSource, oneshot::Sender<Result<()>>);

#[derive(Debug)]
struct Shared {
    tag: String,
    queue: StatusQueue,
    pending_pings: Mutex<HashMap<PingNonce, oneshot::Sender<()>>>,
    status: watch::Sender<LegStatus>,
    source_switch: mpsc::UnboundedSender<ChunkSource>,
    sink_switch: mpsc::UnboundedSender<ChunkSink>,
    attach: mpsc::UnboundedSender<Attached>,
    relay_free_timeout: Duration,
    upgraded: AtomicBool,
    /// Set when the leg ended without an orderly `STOP` or upgrade
    failed: AtomicBool,
}

impl Shared {
    fn pings(&self) -> MutexGuard<'_, HashMap<PingNonce, oneshot::Sender<()>>> {
        self.pending_pings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let changed = self.status.send_if_modified(|status| {
            if *status == LegStatus::Closed {
                false
            } else {
                *status = LegStatus::Closed;
                true
            }
        });
        if changed {
            tracing::debug!("RX [{}] leg closed", self.tag);
        }
    }

    fn mark_upgraded(&self) {
        let changed = self.status.send_if_modified(|status| {
            if *status == LegStatus::Open {
                *status = LegStatus::Upgraded;
                true
            } else {
                false
            }
        });
        if changed {
            self.upgraded.store(true, Ordering::Release);
            tracing::debug!("RX [{}] leg upgraded, freeing relay slot", self.tag);
        }
    }

    fn fail(&self) {
        if !self.upgraded.load(Ordering::Acquire) && !self.is_closed() {
            self.failed.store(true, Ordering::Release);
        }
        self.close();
    }

    fn is_closed(&self) -> bool {
        *self.status.borrow() == LegStatus::Closed
    }

    fn outcome(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            Err(RelayError::StreamClosed)
        } else {
            Ok(())
        }
    }

    fn resolve_pong(&self, nonce: Option<PingNonce>) {
        let mut pings = self.pings();
        match nonce {
            Some(nonce) => {
                if let Some(waiter) = pings.remove(&nonce) {
                    let _ = waiter.send(());
                } else {
                    tracing::trace!("RX [{}] late or unknown PONG", self.tag);
                }
            }
            None => {
                for (_, waiter) in pings.drain() {
                    let _ = waiter.send(());
                }
            }
        }
    }
}

/// Handle to one leg of a relayed circuit.
///
/// Cloning yields another handle to the same leg. The pumping tasks run
/// until the leg is closed.
#[derive(Debug, Clone)]
pub struct RelayContext {
    shared: Arc<Shared>,
}

impl RelayContext {
    /// Start pumping `stream`.
    ///
    /// Returns the context together with the source of chunks relayed from
    /// this party, which is meant to be attached to the other leg.
    #[must_use]
    pub fn new(stream: Stream, relay_free_timeout: Duration) -> (Self, ChunkSource) {
        let (source_switch, source_switch_rx) = mpsc::unbounded_channel();
        let (sink_switch, sink_switch_rx) = mpsc::unbounded_channel();
        let (attach, attach_rx) = mpsc::unbounded_channel();
        let (relayed_tx, relayed_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);
        let (status, _) = watch::channel(LegStatus::Open);

        let shared = Arc::new(Shared {
            tag: relaymesh_core::instance_tag(),
            queue: StatusQueue::new(),
            pending_pings: Mutex::new(HashMap::new()),
            status,
            source_switch,
            sink_switch,
            attach,
            relay_free_timeout,
            upgraded: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });

        let (source, sink) = stream.into_parts();
        tokio::spawn(source_loop(
            shared.clone(),
            source,
            source_switch_rx,
            relayed_tx,
        ));
        tokio::spawn(sink_loop(shared.clone(), sink, sink_switch_rx, attach_rx));

        (Self { shared }, relayed_rx)
    }

    /// Short tag identifying this leg in log lines
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    /// Drain `source` into the party.
    ///
    /// The returned receiver completes once `source` ended or the leg
    /// closed, with an error if the leg broke down instead of stopping.
    pub fn attach(&self, source: ChunkSource) -> oneshot::Receiver<Result<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        if let Err(mpsc::error::SendError((_, done_tx))) = self.shared.attach.send((source, done_tx)) {
            let _ = done_tx.send(Err(RelayError::StreamClosed));
        }
        done_rx
    }

    /// Replace the physical stream after the party reconnected.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::StreamClosed`] if the leg is already closed.
    pub fn update(&self, stream: Stream) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::StreamClosed);
        }

        let (source, sink) = stream.into_parts();
        self.shared
            .sink_switch
            .send(sink)
            .map_err(|_| RelayError::StreamClosed)?;
        self.shared
            .source_switch
            .send(source)
            .map_err(|_| RelayError::StreamClosed)?;

        tracing::debug!("RX [{}] updating stream", self.shared.tag);
        Ok(())
    }

    /// Send a low-level ping to the party.
    ///
    /// Returns the round trip in milliseconds, clamped to `timeout`, or -1
    /// if no answer arrived in time.
    pub async fn ping(&self, timeout: Duration) -> i64 {
        let nonce: PingNonce = rand::random();
        let (tx, rx) = oneshot::channel();
        self.shared.pings().insert(nonce, tx);

        let start = Instant::now();
        self.shared.queue.push(Frame::Ping(Some(nonce)));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                let elapsed = start.elapsed().min(timeout);
                elapsed.as_millis() as i64
            }
            _ => {
                self.shared.pings().remove(&nonce);
                tracing::debug!("RX [{}] ping timeout", self.shared.tag);
                -1
            }
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn status(&self) -> LegStatus {
        *self.shared.status.borrow()
    }

    /// Subscribe to lifecycle changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LegStatus> {
        self.shared.status.subscribe()
    }

    /// Whether the leg is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status() == LegStatus::Closed
    }

    /// Send `STOP` to the party and close the leg
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.shared.queue.push(Frame::Stop);

        let mut status = self.subscribe();
        if tokio::time::timeout(CLOSE_GRACE, wait_closed(&mut status))
            .await
            .is_err()
        {
            tracing::debug!("RX [{}] STOP not written in time, closing", self.shared.tag);
        }
        self.shared.close();
    }
}

async fn wait_closed(status: &mut watch::Receiver<LegStatus>) {
    let _ = status.wait_for(|s| *s == LegStatus::Closed).await;
}

async fn recv_from(source: &mut Option<ChunkSource>) -> Option<Bytes> {
    match source {
        Some(source) => source.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_attached(attached: &mut Option<Attached>) -> Option<Bytes> {
    match attached {
        Some((source, _)) => source.recv().await,
        None => std::future::pending().await,
    }
}

fn is_stop(chunk: &[u8]) -> bool {
    chunk.len() >= 2 && chunk[0] == CONNECTION_STATUS && chunk[1] == STOP
}

/// Reads from the party: answers liveness probes, forwards everything
/// else to the other leg
async fn source_loop(
    shared: Arc<Shared>,
    source: ChunkSource,
    mut switches: mpsc::UnboundedReceiver<ChunkSource>,
    relayed: mpsc::Sender<Bytes>,
) {
    let mut source = Some(source);
    let mut status = shared.status.subscribe();

    loop {
        let chunk = tokio::select! {
            biased;
            () = wait_closed(&mut status) => break,
            Some(next) = switches.recv() => {
                tracing::debug!("RX [{}] source switched", shared.tag);
                source = Some(next);
                if relayed.send(Frame::Restart.encode()).await.is_err() {
                    shared.fail();
                    break;
                }
                continue;
            }
            chunk = recv_from(&mut source) => chunk,
        };

        let Some(chunk) = chunk else {
            if *shared.status.borrow() == LegStatus::Upgraded {
                tracing::debug!("RX [{}] source ended after upgrade", shared.tag);
                shared.close();
                break;
            }
            tracing::debug!("RX [{}] source ended, waiting for reconnect", shared.tag);
            source = None;
            continue;
        };

        let frame = match Frame::decode(&chunk) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("RX [{}] dropping chunk: {}", shared.tag, e);
                continue;
            }
        };

        match frame {
            Frame::Ping(nonce) => {
                tracing::trace!("RX [{}] PING received", shared.tag);
                shared.queue.push(Frame::Pong(nonce));
            }
            Frame::Pong(nonce) => {
                tracing::trace!("RX [{}] PONG received", shared.tag);
                shared.resolve_pong(nonce);
            }
            Frame::Stop => {
                tracing::debug!("RX [{}] STOP relayed", shared.tag);
                shared.close();
                let _ = relayed.send(chunk).await;
                break;
            }
            Frame::Upgraded => {
                if !shared.relay_free_timeout.is_zero() {
                    tokio::time::sleep(shared.relay_free_timeout).await;
                }
                shared.mark_upgraded();
            }
            Frame::Restart | Frame::Payload(_) | Frame::Signalling(_) => {
                if relayed.send(chunk).await.is_err() {
                    tracing::debug!("RX [{}] other leg is gone", shared.tag);
                    shared.fail();
                    break;
                }
            }
        }
    }
}

/// Writes to the party: status messages first, then chunks relayed from
/// the other leg
async fn sink_loop(
    shared: Arc<Shared>,
    sink: ChunkSink,
    mut switches: mpsc::UnboundedReceiver<ChunkSink>,
    mut attach: mpsc::UnboundedReceiver<Attached>,
) {
    let mut sink = Some(sink);
    let mut attached: Option<Attached> = None;
    let mut status = shared.status.subscribe();

    loop {
        let outgoing = tokio::select! {
            biased;
            () = wait_closed(&mut status) => {
                if sink.is_none() && !shared.upgraded.load(Ordering::Acquire) {
                    tracing::debug!("RX [{}] closed while the party was unreachable", shared.tag);
                    shared.failed.store(true, Ordering::Release);
                }
                break;
            }
            Some(next) = switches.recv() => {
                tracing::debug!("RX [{}] sink switched", shared.tag);
                sink = Some(next);
                continue;
            }
            Some(next) = attach.recv(), if attached.is_none() => {
                attached = Some(next);
                continue;
            }
            frame = shared.queue.next(), if sink.is_some() => frame.encode(),
            chunk = recv_attached(&mut attached), if sink.is_some() => match chunk {
                Some(chunk) => match Frame::decode(&chunk) {
                    Ok(_) => chunk,
                    Err(e) => {
                        tracing::debug!("RX [{}] not relaying chunk: {}", shared.tag, e);
                        continue;
                    }
                },
                None => {
                    tracing::debug!("RX [{}] relayed source ended", shared.tag);
                    if let Some(current) = &sink {
                        let _ = current.send(Frame::Stop.encode()).await;
                    }
                    shared.close();
                    break;
                }
            },
        };

        let Some(current) = &sink else {
            continue;
        };

        let stop = is_stop(&outgoing);
        if current.send(outgoing).await.is_err() {
            tracing::debug!("RX [{}] sink failed, waiting for reconnect", shared.tag);
            sink = None;
            continue;
        }

        if stop {
            tracing::debug!("RX [{}] STOP written", shared.tag);
            shared.close();
            break;
        }
    }

    if let Some((_, done)) = attached.take() {
        let _ = done.send(shared.outcome());
    }
    attach.close();
    while let Ok((_, done)) = attach.try_recv() {
        let _ = done.send(shared.outcome());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PAYLOAD, PING, PONG, STATUS_MESSAGE};

    /// Answers every PING with a PONG echoing the nonce
    fn echo_pongs(mut party: Stream) -> tokio::task::JoinHandle<Stream> {
        tokio::spawn(async move {
            while let Some(chunk) = party.recv().await {
                if chunk.len() >= 2 && chunk[0] == STATUS_MESSAGE && chunk[1] == PING {
                    let mut pong = chunk.to_vec();
                    pong[1] = PONG;
                    if party.send(pong).await.is_err() {
                        break;
                    }
                }
            }
            party
        })
    }

    /// Two legs wired together, returning the party ends
    fn circuit() -> (RelayContext, Stream, RelayContext, Stream) {
        let (party_a, leg_a) = Stream::pair();
        let (party_b, leg_b) = Stream::pair();
        let (ctx_a, relayed_a) = RelayContext::new(leg_a, Duration::ZERO);
        let (ctx_b, relayed_b) = RelayContext::new(leg_b, Duration::ZERO);
        let _ = ctx_a.attach(relayed_b);
        let _ = ctx_b.attach(relayed_a);
        (ctx_a, party_a, ctx_b, party_b)
    }

    async fn recv(stream: &mut Stream) -> Bytes {
        tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let (party, leg) = Stream::pair();
        let (ctx, _relayed) = RelayContext::new(leg, Duration::ZERO);
        let _party = echo_pongs(party);

        let rtt = ctx.ping(DEFAULT_PING_TIMEOUT).await;
        assert!((0..=300).contains(&rtt));
    }

    #[tokio::test]
    async fn test_ping_timeout_then_success() {
        let (mut party, leg) = Stream::pair();
        let (ctx, _relayed) = RelayContext::new(leg, Duration::ZERO);

        assert_eq!(ctx.ping(Duration::from_millis(50)).await, -1);

        // Drop the unanswered ping, then start answering
        let stale = recv(&mut party).await;
        assert_eq!(&stale[..2], &[STATUS_MESSAGE, PING]);
        let _party = echo_pongs(party);

        assert!(ctx.ping(DEFAULT_PING_TIMEOUT).await >= 0);
    }

    #[tokio::test]
    async fn test_party_ping_gets_pong() {
        let (mut party, leg) = Stream::pair();
        let (_ctx, _relayed) = RelayContext::new(leg, Duration::ZERO);

        party
            .send(Frame::Ping(Some([1, 2, 3, 4])).encode())
            .await
            .unwrap();
        let answer = recv(&mut party).await;
        assert_eq!(Frame::decode(&answer).unwrap(), Frame::Pong(Some([1, 2, 3, 4])));
    }

    #[tokio::test]
    async fn test_payload_forwarded_both_ways() {
        let (_ctx_a, mut party_a, _ctx_b, mut party_b) = circuit();

        party_a.send(Bytes::from_static(&[PAYLOAD, 1, 2, 3])).await.unwrap();
        assert_eq!(recv(&mut party_b).await, Bytes::from_static(&[PAYLOAD, 1, 2, 3]));

        party_b.send(Bytes::from_static(&[PAYLOAD, 4])).await.unwrap();
        assert_eq!(recv(&mut party_a).await, Bytes::from_static(&[PAYLOAD, 4]));
    }

    #[tokio::test]
    async fn test_empty_payload_forwarded() {
        let (_ctx_a, party_a, _ctx_b, mut party_b) = circuit();

        party_a.send(Bytes::from_static(&[PAYLOAD])).await.unwrap();
        party_a.send(Bytes::from_static(&[PAYLOAD, 9])).await.unwrap();
        assert_eq!(recv(&mut party_b).await, Bytes::from_static(&[PAYLOAD]));
        assert_eq!(recv(&mut party_b).await, Bytes::from_static(&[PAYLOAD, 9]));
    }

    #[tokio::test]
    async fn test_stop_closes_both_legs() {
        let (ctx_a, party_a, ctx_b, mut party_b) = circuit();

        party_a.send(Frame::Stop.encode()).await.unwrap();
        assert_eq!(Frame::decode(&recv(&mut party_b).await).unwrap(), Frame::Stop);

        let mut a = ctx_a.subscribe();
        let mut b = ctx_b.subscribe();
        tokio::time::timeout(Duration::from_secs(1), wait_closed(&mut a))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), wait_closed(&mut b))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_announces_restart() {
        let (ctx_a, _party_a, _ctx_b, mut party_b) = circuit();

        let (mut new_party_a, new_leg_a) = Stream::pair();
        ctx_a.update(new_leg_a).unwrap();
        assert_eq!(Frame::decode(&recv(&mut party_b).await).unwrap(), Frame::Restart);

        // Traffic now flows over the new stream
        party_b.send(Bytes::from_static(&[PAYLOAD, 7])).await.unwrap();
        assert_eq!(recv(&mut new_party_a).await, Bytes::from_static(&[PAYLOAD, 7]));
    }

    #[tokio::test]
    async fn test_upgraded_marks_leg() {
        let (ctx_a, party_a, _ctx_b, _party_b) = circuit();

        party_a.send(Frame::Upgraded.encode()).await.unwrap();
        let mut status = ctx_a.subscribe();
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| *s == LegStatus::Upgraded),
        )
        .await
        .unwrap()
        .unwrap();

        // End of the source closes an upgraded leg
        drop(party_a);
        tokio::time::timeout(Duration::from_secs(1), wait_closed(&mut status))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_writes_stop() {
        let (mut party, leg) = Stream::pair();
        let (ctx, _relayed) = RelayContext::new(leg, Duration::ZERO);

        ctx.close().await;
        assert!(ctx.is_closed());
        assert_eq!(Frame::decode(&recv(&mut party).await).unwrap(), Frame::Stop);
        assert!(ctx.update(Stream::pair().0).is_err());
    }
}
