//! Relayed connection that migrates to a direct channel.
//!
//! Every application chunk is prefixed with [`NOT_DONE`] while it travels
//! over the relay. Once the direct channel is established the sink sends a
//! lone [`DONE`] over the relay, announces `UPGRADED` and continues on the
//! direct stream with the same framing. The source reads the relay until the
//! counterparty's [`DONE`] and then switches to the direct stream.
//!
//! The relayed connection is closed once both directions have moved. If the
//! counterparty moved while this side gave up on its channel, nothing more
//! can arrive and the connection ends.

use super::channel::DirectChannel;
use crate::connection::{RelayConnection, RelayConnectionHandle, Timeline};
use crate::error::{RelayError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use relaymesh_core::stream::DEFAULT_STREAM_CAPACITY;
use relaymesh_core::{Address, ChunkSink, ChunkSource, PeerId, Stream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};

/// More chunks follow on the current path
pub const NOT_DONE: u8 = 0;

/// Last chunk on the current path
pub const DONE: u8 = 1;

const BOTH_DIRECTIONS: u8 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn not_done(data: &[u8]) -> Bytes {
    let mut chunk = BytesMut::with_capacity(data.len() + 1);
    chunk.put_u8(NOT_DONE);
    chunk.put_slice(data);
    chunk.freeze()
}

#[derive(Debug)]
struct Shared {
    tag: String,
    relay: RelayConnectionHandle,
    channel: Option<Arc<dyn DirectChannel>>,
    migrated: AtomicU8,
    /// Keeps the relayed connection open until both directions moved
    relay_sink: Mutex<Option<ChunkSink>>,
    closed: watch::Sender<bool>,
    timeline: Mutex<Timeline>,
}

impl Shared {
    fn direction_migrated(&self, direction: &str) {
        tracing::debug!("WEBRTC [{}] {} moved to the direct channel", self.tag, direction);
        if self.migrated.fetch_add(1, Ordering::AcqRel) + 1 == BOTH_DIRECTIONS {
            tracing::info!(
                "WEBRTC [{}] connection to {} is direct, closing relayed connection",
                self.tag,
                self.relay.counterparty().short()
            );
            // Dropping the sink flushes pending chunks before `STOP`
            lock(&self.relay_sink).take();
        }
    }

    fn abandon_channel(&self) {
        if let Some(channel) = &self.channel {
            channel.destroy();
        }
    }

    fn mark_ended(&self) {
        lock(&self.timeline).close.get_or_insert_with(now_millis);
    }

    async fn shut_down(&self) {
        self.closed.send_replace(true);
        self.mark_ended();
        self.abandon_channel();
        self.relay.close().await;
        lock(&self.relay_sink).take();
    }
}

/// Control handle of a [`WebRtcConnection`]
#[derive(Debug, Clone)]
pub struct WebRtcHandle {
    shared: Arc<Shared>,
}

impl WebRtcHandle {
    /// Short tag identifying the connection in log lines
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    /// The relayed connection this one started on
    #[must_use]
    pub fn relay(&self) -> &RelayConnectionHandle {
        &self.shared.relay
    }

    /// Node at the other end
    #[must_use]
    pub fn counterparty(&self) -> PeerId {
        self.shared.relay.counterparty()
    }

    /// Circuit address the connection was opened on
    #[must_use]
    pub fn remote_addr(&self) -> Address {
        self.shared.relay.remote_addr()
    }

    /// Whether both directions use the direct channel
    #[must_use]
    pub fn is_migrated(&self) -> bool {
        self.shared.migrated.load(Ordering::Acquire) >= BOTH_DIRECTIONS
    }

    /// Open and close timestamps
    #[must_use]
    pub fn timeline(&self) -> Timeline {
        *lock(&self.shared.timeline)
    }

    /// Tear down the direct channel and the relayed connection
    pub async fn close(&self) {
        self.shared.shut_down().await;
    }
}

/// Application stream that starts relayed and moves to a direct channel
#[derive(Debug)]
pub struct WebRtcConnection {
    stream: Stream,
    handle: WebRtcHandle,
}

impl WebRtcConnection {
    /// Wrap `relayed`, whose direct channel is negotiated in the background.
    ///
    /// Without a channel, or when it is not established within
    /// `upgrade_timeout`, all traffic stays on the relay.
    #[must_use]
    pub fn new(relayed: RelayConnection, upgrade_timeout: Duration) -> Self {
        let (relay_stream, relay) = relayed.into_parts();
        let channel = relay.channel();
        let established = channel.as_ref().and_then(|c| c.take_established());
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            tag: relay.tag().to_string(),
            timeline: Mutex::new(Timeline {
                open: relay.timeline().open,
                close: None,
            }),
            relay,
            channel,
            migrated: AtomicU8::new(0),
            relay_sink: Mutex::new(None),
            closed,
        });

        let (app_in_tx, app_in_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);
        let (app_out_tx, app_out_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);
        let (direct_tx, direct_rx) = oneshot::channel();
        let (relay_source, relay_sink) = relay_stream.into_parts();

        tokio::spawn(sink_task(
            shared.clone(),
            app_out_rx,
            relay_sink,
            established,
            upgrade_timeout,
            Some(direct_tx),
        ));
        tokio::spawn(source_task(shared.clone(), relay_source, app_in_tx, direct_rx));

        Self {
            stream: Stream::new(app_in_rx, app_out_tx),
            handle: WebRtcHandle { shared },
        }
    }

    /// Control handle
    #[must_use]
    pub fn handle(&self) -> &WebRtcHandle {
        &self.handle
    }

    /// Split into the application stream and the control handle
    #[must_use]
    pub fn into_parts(self) -> (Stream, WebRtcHandle) {
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

async fn wait_set(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

async fn wait_established(
    established: &mut Option<oneshot::Receiver<Result<Stream>>>,
) -> Result<Stream> {
    match established {
        Some(rx) => rx.await.unwrap_or(Err(RelayError::StreamClosed)),
        None => std::future::pending().await,
    }
}

async fn sink_task(
    shared: Arc<Shared>,
    mut app: ChunkSource,
    relay: ChunkSink,
    mut established: Option<oneshot::Receiver<Result<Stream>>>,
    upgrade_timeout: Duration,
    mut direct_tx: Option<oneshot::Sender<ChunkSource>>,
) {
    let mut closed = shared.closed.subscribe();
    let deadline = tokio::time::sleep(upgrade_timeout);
    tokio::pin!(deadline);

    let direct = loop {
        tokio::select! {
            biased;
            _ = wait_set(&mut closed) => return,
            result = wait_established(&mut established) => {
                established = None;
                match result {
                    Ok(direct) => break direct,
                    Err(e) => {
                        tracing::debug!("WEBRTC [{}] staying on the relay: {}", shared.tag, e);
                        shared.abandon_channel();
                        // The source stops waiting for a direct stream
                        direct_tx = None;
                    }
                }
            }
            _ = &mut deadline, if established.is_some() => {
                established = None;
                tracing::debug!("WEBRTC [{}] direct channel timed out, staying on the relay", shared.tag);
                shared.abandon_channel();
                direct_tx = None;
            }
            data = app.recv() => match data {
                Some(data) => {
                    if relay.send(not_done(&data)).await.is_err() {
                        tracing::debug!("WEBRTC [{}] relayed connection gone", shared.tag);
                        return;
                    }
                }
                None => {
                    if established.is_some() {
                        shared.abandon_channel();
                    }
                    return;
                }
            },
        }
    };

    let (direct_source, direct_sink) = direct.into_parts();
    if relay.send(Bytes::from_static(&[DONE])).await.is_err() {
        tracing::debug!("WEBRTC [{}] could not end the relayed path", shared.tag);
    }
    shared.relay.send_upgraded();
    *lock(&shared.relay_sink) = Some(relay);
    if let Some(direct_tx) = direct_tx.take() {
        if direct_tx.send(direct_source).is_err() {
            tracing::trace!("WEBRTC [{}] source already finished", shared.tag);
        }
    }
    shared.direction_migrated("sink");

    loop {
        tokio::select! {
            biased;
            _ = wait_set(&mut closed) => break,
            data = app.recv() => match data {
                Some(data) => {
                    if direct_sink.send(not_done(&data)).await.is_err() {
                        tracing::debug!("WEBRTC [{}] direct stream gone", shared.tag);
                        break;
                    }
                }
                None => {
                    let _ = direct_sink.send(Bytes::from_static(&[DONE])).await;
                    break;
                }
            },
        }
    }
}

/// Forward `NOT_DONE` chunks until `DONE` or the end of `source`. Returns
/// whether `DONE` was seen.
async fn forward_until_done(
    shared: &Shared,
    source: &mut ChunkSource,
    app: &ChunkSink,
    closed: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = wait_set(closed) => return false,
            chunk = source.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            return false;
        };
        match chunk.first() {
            Some(&NOT_DONE) => {
                if app.send(chunk.slice(1..)).await.is_err() {
                    tracing::trace!("WEBRTC [{}] application dropped its source", shared.tag);
                }
            }
            Some(&DONE) => return true,
            _ => tracing::debug!("WEBRTC [{}] dropping unframed chunk", shared.tag),
        }
    }
}

async fn source_task(
    shared: Arc<Shared>,
    mut relay: ChunkSource,
    app: ChunkSink,
    direct_rx: oneshot::Receiver<ChunkSource>,
) {
    let mut closed = shared.closed.subscribe();

    if forward_until_done(&shared, &mut relay, &app, &mut closed).await {
        drop(relay);
        let direct = tokio::select! {
            biased;
            _ = wait_set(&mut closed) => None,
            direct = direct_rx => Some(direct),
        };
        match direct {
            Some(Ok(mut direct)) => {
                shared.direction_migrated("source");
                forward_until_done(&shared, &mut direct, &app, &mut closed).await;
            }
            Some(Err(_)) => {
                // Nothing more can arrive over the relay
                tracing::warn!(
                    "WEBRTC [{}] counterparty moved to a direct channel that is not up here, closing",
                    shared.tag
                );
                shared.shut_down().await;
                drop(app);
                return;
            }
            None => {}
        }
    }

    shared.mark_ended();
    tracing::debug!("WEBRTC [{}] incoming side ended", shared.tag);
}
