//! Endpoint side of a relayed circuit.
//!
//! A [`RelayConnection`] turns the raw stream to the relay into an
//! application stream: outgoing chunks are prefixed with `PAYLOAD`, control
//! messages are answered or acted upon, and signalling for a direct channel
//! is exchanged in the background.
//!
//! When the counterparty reconnects to the relay, the relay announces
//! `RESTART`. The connection then switches: the generation counter is
//! bumped, the current application stream is ended and a fresh
//! [`RelayConnection`] over the same relay stream is handed to the
//! reconnect listener.

use crate::error::Result;
use crate::protocol::{Frame, StatusQueue};
use crate::webrtc::{DirectChannel, DirectChannelFactory};
use bytes::Bytes;
use relaymesh_core::stream::DEFAULT_STREAM_CAPACITY;
use relaymesh_core::{Address, ChunkSink, ChunkSource, PeerId, Stream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

/// How long [`RelayConnectionHandle::close`] waits for the relay to
/// acknowledge
const CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Receives connections that replaced a previous one after a reconnect
pub type ReconnectSender = mpsc::UnboundedSender<RelayConnection>;

/// Open and close timestamps in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    /// When the connection was created
    pub open: u64,
    /// When the connection was closed, if it was
    pub close: Option<u64>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Options for [`RelayConnection::new`]
#[derive(Debug, Default, Clone)]
pub struct ConnectionOptions {
    /// Where to emit connections created by a reconnect
    pub on_reconnect: Option<ReconnectSender>,
    /// Direct channel negotiated over this connection
    pub channel: Option<Arc<dyn DirectChannel>>,
    /// Creates a fresh answering channel after a reconnect
    pub channel_factory: Option<Arc<dyn DirectChannelFactory>>,
}

#[derive(Debug)]
struct Shared {
    tag: String,
    relay: PeerId,
    counterparty: PeerId,
    queue: StatusQueue,
    iteration: AtomicU64,
    closed: watch::Sender<bool>,
    destroyed: watch::Sender<bool>,
    timeline: Mutex<Timeline>,
    channel: Mutex<Option<Arc<dyn DirectChannel>>>,
    channel_factory: Option<Arc<dyn DirectChannelFactory>>,
    on_reconnect: Option<ReconnectSender>,
}

impl Shared {
    fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel(&self) -> Option<Arc<dyn DirectChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_closed(&self) {
        let changed = self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
        if changed {
            let mut timeline = self.timeline();
            timeline.close.get_or_insert_with(now_millis);
            tracing::debug!("RELAY [{}] closed", self.tag);
        }
    }

    fn set_destroyed(&self) {
        self.destroyed.send_if_modified(|destroyed| !std::mem::replace(destroyed, true));
        self.set_closed();
    }

    fn is_destroyed(&self) -> bool {
        *self.destroyed.borrow()
    }

    /// Forward signals of `channel` while `iteration` is current
    fn forward_signals(self: &Arc<Self>, channel: &Arc<dyn DirectChannel>, iteration: u64) {
        let Some(mut signals) = channel.take_signals() else {
            return;
        };
        let shared = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                if shared.iteration.load(Ordering::Acquire) != iteration || *shared.closed.borrow() {
                    break;
                }
                match serde_json::to_vec(&signal) {
                    Ok(encoded) => shared.queue.push(Frame::Signalling(Bytes::from(encoded))),
                    Err(e) => tracing::debug!("RELAY [{}] cannot encode signal: {}", shared.tag, e),
                }
            }
        });
    }

    async fn feed_signal(&self, body: &[u8]) {
        let Some(channel) = self.channel() else {
            return;
        };
        if channel.is_connected() {
            return;
        }
        let message = match serde_json::from_slice(body) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("RELAY [{}] invalid signalling message: {}", self.tag, e);
                return;
            }
        };
        if let Err(e) = channel.signal(message).await {
            tracing::debug!("RELAY [{}] direct channel error: {}", self.tag, e);
        }
    }
}

/// Control handle of a relayed connection.
///
/// Stays valid across reconnects; all connections handed out after a
/// `RESTART` share it.
#[derive(Debug, Clone)]
pub struct RelayConnectionHandle {
    shared: Arc<Shared>,
}

impl RelayConnectionHandle {
    /// Short tag identifying the connection in log lines
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    /// Relay forwarding the traffic
    #[must_use]
    pub fn relay(&self) -> PeerId {
        self.shared.relay
    }

    /// Node at the other end of the circuit
    #[must_use]
    pub fn counterparty(&self) -> PeerId {
        self.shared.counterparty
    }

    /// `/p2p/<relay>/p2p-circuit/p2p/<counterparty>`
    #[must_use]
    pub fn remote_addr(&self) -> Address {
        Address::circuit(self.shared.relay, self.shared.counterparty)
    }

    /// Open and close timestamps
    #[must_use]
    pub fn timeline(&self) -> Timeline {
        *self.shared.timeline()
    }

    /// Number of reconnects so far
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.shared.iteration.load(Ordering::Acquire)
    }

    /// Whether the connection was closed locally or remotely
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Whether the relay stream is finished
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Watch the destroyed flag
    #[must_use]
    pub fn destroyed(&self) -> watch::Receiver<bool> {
        self.shared.destroyed.subscribe()
    }

    /// Current direct channel, if any
    #[must_use]
    pub fn channel(&self) -> Option<Arc<dyn DirectChannel>> {
        self.shared.channel()
    }

    /// Tell the relay that traffic moved to a direct channel
    pub fn send_upgraded(&self) {
        tracing::debug!("RELAY [{}] sending UPGRADED", self.shared.tag);
        self.shared.queue.push(Frame::Upgraded);
    }

    /// Send `STOP` and wait briefly for the relay stream to finish
    pub async fn close(&self) {
        if self.is_destroyed() {
            self.shared.set_closed();
            return;
        }

        self.shared.set_closed();
        let mut destroyed = self.destroyed();
        if tokio::time::timeout(CLOSE_TIMEOUT, wait_set(&mut destroyed))
            .await
            .is_err()
        {
            tracing::debug!("RELAY [{}] close timed out", self.shared.tag);
        }
    }
}

/// Application-facing end of a relayed connection
#[derive(Debug)]
pub struct RelayConnection {
    stream: Stream,
    handle: RelayConnectionHandle,
}

impl RelayConnection {
    /// Wrap `stream`, the stream to `relay` after a successful handshake,
    /// as a connection to `counterparty`
    #[must_use]
    pub fn new(stream: Stream, relay: PeerId, counterparty: PeerId, options: ConnectionOptions) -> Self {
        let (closed, _) = watch::channel(false);
        let (destroyed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            tag: relaymesh_core::instance_tag(),
            relay,
            counterparty,
            queue: StatusQueue::new(),
            iteration: AtomicU64::new(0),
            closed,
            destroyed,
            timeline: Mutex::new(Timeline {
                open: now_millis(),
                close: None,
            }),
            channel: Mutex::new(options.channel.clone()),
            channel_factory: options.channel_factory,
            on_reconnect: options.on_reconnect,
        });

        if let Some(channel) = &options.channel {
            shared.forward_signals(channel, 0);
        }

        let (app_in_tx, app_in_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);
        let (app_out_tx, app_out_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);
        let (switch_tx, switch_rx) = mpsc::unbounded_channel();

        let (relay_source, relay_sink) = stream.into_parts();
        tokio::spawn(sink_loop(shared.clone(), relay_sink, app_out_rx, switch_rx));
        tokio::spawn(source_loop(shared.clone(), relay_source, app_in_tx, switch_tx));

        tracing::debug!(
            "RELAY [{}] connection to {} via {}",
            shared.tag,
            counterparty.short(),
            relay.short()
        );

        Self {
            stream: Stream::new(app_in_rx, app_out_tx),
            handle: RelayConnectionHandle { shared },
        }
    }

    /// Control handle
    #[must_use]
    pub fn handle(&self) -> &RelayConnectionHandle {
        &self.handle
    }

    /// Split into the application stream and the control handle
    #[must_use]
    pub fn into_parts(self) -> (Stream, RelayConnectionHandle) {
        (self.stream, self.handle)
    }

    /// Send application bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection no longer accepts data.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        Ok(self.stream.send(data).await?)
    }

    /// Receive application bytes, `None` once the connection ended
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.stream.recv().await
    }
}

/// Writes to the relay. Priority: close, switch, status messages, payload.
async fn sink_loop(
    shared: Arc<Shared>,
    relay: ChunkSink,
    app: ChunkSource,
    mut switches: mpsc::UnboundedReceiver<ChunkSource>,
) {
    let mut app = Some(app);
    let mut closed = shared.closed.subscribe();

    loop {
        let frame = tokio::select! {
            biased;
            _ = wait_set(&mut closed) => {
                if !shared.is_destroyed() {
                    let _ = relay.send(Frame::Stop.encode()).await;
                }
                break;
            }
            Some(next) = switches.recv() => {
                app = Some(next);
                continue;
            }
            frame = shared.queue.next() => frame,
            data = recv_app(&mut app) => match data {
                Some(data) => Frame::Payload(data),
                None => {
                    tracing::debug!("RELAY [{}] application stream ended", shared.tag);
                    app = None;
                    Frame::Stop
                }
            },
        };

        let stop = frame.is_stop();
        if relay.send(frame.encode()).await.is_err() {
            tracing::debug!("RELAY [{}] relay stream gone", shared.tag);
            break;
        }
        if stop {
            break;
        }
    }

    shared.set_destroyed();
}

async fn wait_set(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

async fn recv_app(app: &mut Option<ChunkSource>) -> Option<Bytes> {
    match app {
        Some(app) => app.recv().await,
        None => std::future::pending().await,
    }
}

/// Reads from the relay and dispatches by prefix
async fn source_loop(
    shared: Arc<Shared>,
    mut relay: ChunkSource,
    mut app: ChunkSink,
    switches: mpsc::UnboundedSender<ChunkSource>,
) {
    let mut destroyed = shared.destroyed.subscribe();
    let mut generation = shared.iteration.load(Ordering::Acquire);

    loop {
        let chunk = tokio::select! {
            biased;
            _ = wait_set(&mut destroyed) => break,
            chunk = relay.recv() => chunk,
        };

        let Some(chunk) = chunk else {
            tracing::debug!("RELAY [{}] relay closed the stream", shared.tag);
            break;
        };

        let frame = match Frame::decode(&chunk) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("RELAY [{}] dropping chunk: {}", shared.tag, e);
                continue;
            }
        };

        match frame {
            Frame::Stop => {
                tracing::debug!("RELAY [{}] STOP received", shared.tag);
                break;
            }
            Frame::Restart => {
                tracing::debug!("RELAY [{}] RESTART received", shared.tag);
                (generation, app) = switch(&shared, &switches).await;
            }
            Frame::Ping(nonce) => shared.queue.push(Frame::Pong(nonce)),
            Frame::Pong(_) | Frame::Upgraded => {}
            Frame::Signalling(body) => shared.feed_signal(&body).await,
            Frame::Payload(data) => {
                if shared.iteration.load(Ordering::Acquire) != generation {
                    tracing::trace!("RELAY [{}] dropping payload of an old generation", shared.tag);
                    continue;
                }
                if app.send(data).await.is_err() {
                    tracing::trace!("RELAY [{}] application dropped its source", shared.tag);
                }
            }
        }
    }

    shared.set_destroyed();
}

/// Start a new generation and hand a fresh connection to the reconnect
/// listener. Returns the generation and the sink of its application stream.
async fn switch(
    shared: &Arc<Shared>,
    switches: &mpsc::UnboundedSender<ChunkSource>,
) -> (u64, ChunkSink) {
    let iteration = shared.iteration.fetch_add(1, Ordering::AcqRel) + 1;

    if let Some(old) = shared.channel() {
        old.destroy();
        let replacement = match &shared.channel_factory {
            Some(factory) => match factory.inbound().await {
                Ok(channel) => Some(channel),
                Err(e) => {
                    tracing::debug!("RELAY [{}] no direct channel after reconnect: {}", shared.tag, e);
                    None
                }
            },
            None => None,
        };
        if let Some(channel) = &replacement {
            shared.forward_signals(channel, iteration);
        }
        *shared.channel.lock().unwrap_or_else(PoisonError::into_inner) = replacement;
    }

    let (app_in_tx, app_in_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);
    let (app_out_tx, app_out_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);
    let _ = switches.send(app_out_rx);

    let connection = RelayConnection {
        stream: Stream::new(app_in_rx, app_out_tx),
        handle: RelayConnectionHandle {
            shared: shared.clone(),
        },
    };

    match &shared.on_reconnect {
        Some(listener) => {
            if listener.send(connection).is_err() {
                tracing::debug!("RELAY [{}] reconnect listener is gone", shared.tag);
            }
        }
        None => tracing::debug!("RELAY [{}] reconnect without listener", shared.tag),
    }

    (iteration, app_in_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CONNECTION_STATUS, PAYLOAD, STOP, UPGRADED};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn connection(options: ConnectionOptions) -> (RelayConnection, Stream) {
        let (local, relay) = Stream::pair();
        let conn = RelayConnection::new(local, PeerId::random(), PeerId::random(), options);
        (conn, relay)
    }

    async fn recv(stream: &mut Stream) -> Option<Bytes> {
        tokio::time::timeout(TIMEOUT, stream.recv()).await.unwrap()
    }

    #[tokio::test]
    async fn test_payload_both_ways() {
        let (mut conn, mut relay) = connection(ConnectionOptions::default());

        conn.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(
            recv(&mut relay).await.unwrap(),
            Bytes::from_static(&[PAYLOAD, b'h', b'e', b'l', b'l', b'o'])
        );

        relay.send(Bytes::from_static(&[PAYLOAD, b'!'])).await.unwrap();
        assert_eq!(
            tokio::time::timeout(TIMEOUT, conn.recv()).await.unwrap().unwrap(),
            Bytes::from_static(b"!")
        );
    }

    #[tokio::test]
    async fn test_ping_answered_with_nonce() {
        let (_conn, mut relay) = connection(ConnectionOptions::default());

        relay.send(Frame::Ping(Some([4, 3, 2, 1])).encode()).await.unwrap();
        let answer = recv(&mut relay).await.unwrap();
        assert_eq!(Frame::decode(&answer).unwrap(), Frame::Pong(Some([4, 3, 2, 1])));
    }

    #[tokio::test]
    async fn test_remote_stop_destroys() {
        let (mut conn, relay) = connection(ConnectionOptions::default());
        let handle = conn.handle().clone();

        relay.send(Frame::Stop.encode()).await.unwrap();
        assert!(tokio::time::timeout(TIMEOUT, conn.recv()).await.unwrap().is_none());

        let mut destroyed = handle.destroyed();
        tokio::time::timeout(TIMEOUT, destroyed.wait_for(|d| *d))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_closed());
        assert!(handle.timeline().close.is_some());
    }

    #[tokio::test]
    async fn test_close_sends_stop() {
        let (conn, mut relay) = connection(ConnectionOptions::default());
        let handle = conn.handle().clone();

        handle.close().await;
        assert_eq!(
            recv(&mut relay).await.unwrap(),
            Bytes::from_static(&[CONNECTION_STATUS, STOP])
        );
        assert!(handle.is_destroyed());
        assert!(handle.timeline().close.is_some());
    }

    #[tokio::test]
    async fn test_application_end_sends_stop() {
        let (conn, mut relay) = connection(ConnectionOptions::default());
        let (stream, handle) = conn.into_parts();
        drop(stream);

        assert_eq!(
            recv(&mut relay).await.unwrap(),
            Bytes::from_static(&[CONNECTION_STATUS, STOP])
        );
        let mut destroyed = handle.destroyed();
        tokio::time::timeout(TIMEOUT, destroyed.wait_for(|d| *d))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_upgraded() {
        let (conn, mut relay) = connection(ConnectionOptions::default());
        conn.handle().send_upgraded();
        assert_eq!(
            recv(&mut relay).await.unwrap(),
            Bytes::from_static(&[CONNECTION_STATUS, UPGRADED])
        );
    }

    #[tokio::test]
    async fn test_restart_switches_connection() {
        let (reconnect_tx, mut reconnects) = mpsc::unbounded_channel();
        let (mut conn, mut relay) = connection(ConnectionOptions {
            on_reconnect: Some(reconnect_tx),
            ..ConnectionOptions::default()
        });
        assert_eq!(conn.handle().remote_addr().relay(), Some(conn.handle().relay()));

        relay.send(Frame::Restart.encode()).await.unwrap();
        let mut switched = tokio::time::timeout(TIMEOUT, reconnects.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(switched.handle().iteration(), 1);

        // The stale application stream ended
        assert!(tokio::time::timeout(TIMEOUT, conn.recv()).await.unwrap().is_none());

        relay.send(Bytes::from_static(&[PAYLOAD, 9])).await.unwrap();
        assert_eq!(
            tokio::time::timeout(TIMEOUT, switched.recv()).await.unwrap().unwrap(),
            Bytes::from_static(&[9])
        );

        switched.send(Bytes::from_static(&[8])).await.unwrap();
        assert_eq!(recv(&mut relay).await.unwrap(), Bytes::from_static(&[PAYLOAD, 8]));
    }

    #[tokio::test]
    async fn test_payload_follows_generation() {
        let (reconnect_tx, mut reconnects) = mpsc::unbounded_channel();
        let (mut conn, relay) = connection(ConnectionOptions {
            on_reconnect: Some(reconnect_tx),
            ..ConnectionOptions::default()
        });

        relay.send(Bytes::from_static(&[PAYLOAD, 1])).await.unwrap();
        relay.send(Frame::Restart.encode()).await.unwrap();
        relay.send(Bytes::from_static(&[PAYLOAD, 2])).await.unwrap();

        // Data before the restart belongs to the old stream only
        assert_eq!(
            tokio::time::timeout(TIMEOUT, conn.recv()).await.unwrap(),
            Some(Bytes::from_static(&[1]))
        );
        assert!(tokio::time::timeout(TIMEOUT, conn.recv()).await.unwrap().is_none());

        let mut switched = tokio::time::timeout(TIMEOUT, reconnects.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            tokio::time::timeout(TIMEOUT, switched.recv()).await.unwrap(),
            Some(Bytes::from_static(&[2]))
        );
    }
}
