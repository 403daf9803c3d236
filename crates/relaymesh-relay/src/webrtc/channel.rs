//! Direct channels negotiated over a relayed circuit.
//!
//! A [`DirectChannel`] produces signalling messages that travel over the
//! relay as `WEBRTC_SIGNALLING` frames, consumes the ones sent by the
//! counterparty and eventually yields a direct [`Stream`] to it.
//!
//! [`TcpDirectChannel`] is the bundled implementation: the initiating side
//! listens on an ephemeral port and offers its candidate addresses together
//! with a random token; the answering side dials all candidates in parallel
//! and proves itself by sending the token back.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use futures::future::select_ok;
use relaymesh_core::{Stream, StreamTask};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Length of the proof token
const TOKEN_LEN: usize = 16;

/// Byte the initiator sends to confirm a verified token
const TOKEN_ACK: u8 = 1;

/// Timeout for each candidate dial and for the token exchange
const CANDIDATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Direct channel to the counterparty of a relayed connection
#[async_trait]
pub trait DirectChannel: Send + Sync + fmt::Debug {
    /// Feed a signalling message received from the counterparty.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is malformed or arrives in the wrong
    /// role.
    async fn signal(&self, message: Value) -> Result<()>;

    /// Signalling messages to send to the counterparty. Can be taken once.
    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<Value>>;

    /// Whether the direct stream is up
    fn is_connected(&self) -> bool;

    /// Completes with the direct stream or the reason there is none. Can be
    /// taken once.
    fn take_established(&self) -> Option<oneshot::Receiver<Result<Stream>>>;

    /// Tear the channel down, including an established direct stream
    fn destroy(&self);
}

/// Creates direct channels for new relayed connections
#[async_trait]
pub trait DirectChannelFactory: Send + Sync + fmt::Debug {
    /// Channel for the side that opened the relayed connection.
    ///
    /// # Errors
    ///
    /// Returns an error if local resources could not be set up.
    async fn outbound(&self) -> Result<Arc<dyn DirectChannel>>;

    /// Channel for the side that accepted the relayed connection.
    ///
    /// # Errors
    ///
    /// Returns an error if local resources could not be set up.
    async fn inbound(&self) -> Result<Arc<dyn DirectChannel>>;
}

/// Signalling messages of [`TcpDirectChannel`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TcpSignal {
    /// Initiator's listening candidates and proof token
    Offer {
        /// Hex-encoded token
        token: String,
        /// Addresses the initiator listens on
        candidates: Vec<SocketAddr>,
    },
}

/// Role of a [`TcpDirectChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listens and offers candidates
    Initiator,
    /// Dials the offered candidates
    Answerer,
}

/// Result slot shared between a channel and its background tasks
struct Outcome {
    tag: String,
    connected: AtomicBool,
    destroyed: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<Result<Stream>>>>,
    stream_task: Mutex<Option<StreamTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Outcome {
    /// Hand the verified socket out, unless another one won or the channel
    /// was destroyed
    fn establish(&self, socket: TcpStream) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        let Some(tx) = lock(&self.tx).take() else {
            return false;
        };

        let (stream, task) = Stream::framed(socket);
        *lock(&self.stream_task) = Some(task);
        self.connected.store(true, Ordering::Release);
        tracing::debug!("DIRECT [{}] connected", self.tag);

        if tx.send(Ok(stream)).is_err() {
            tracing::debug!("DIRECT [{}] nobody waits for the direct stream", self.tag);
        }
        true
    }

    fn fail(&self, reason: String) {
        if let Some(tx) = lock(&self.tx).take() {
            tracing::debug!("DIRECT [{}] failed: {}", self.tag, reason);
            let _ = tx.send(Err(RelayError::Signalling(reason)));
        }
    }
}

/// Direct channel over a plain TCP connection
pub struct TcpDirectChannel {
    role: Role,
    outcome: Arc<Outcome>,
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    established_rx: Mutex<Option<oneshot::Receiver<Result<Stream>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for TcpDirectChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpDirectChannel")
            .field("tag", &self.outcome.tag)
            .field("role", &self.role)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl TcpDirectChannel {
    fn with_role(role: Role) -> (Self, mpsc::UnboundedSender<Value>) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (established_tx, established_rx) = oneshot::channel();
        let channel = Self {
            role,
            outcome: Arc::new(Outcome {
                tag: relaymesh_core::instance_tag(),
                connected: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                tx: Mutex::new(Some(established_tx)),
                stream_task: Mutex::new(None),
            }),
            signals_rx: Mutex::new(Some(signals_rx)),
            established_rx: Mutex::new(Some(established_rx)),
            tasks: Mutex::new(Vec::new()),
        };
        (channel, signals_tx)
    }

    /// Listen on `bind_ip` and offer the resulting port on each of
    /// `candidate_ips`.
    ///
    /// With no candidate IPs the bound address itself is offered, with
    /// loopback standing in for an unspecified address.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn initiator(bind_ip: IpAddr, candidate_ips: &[IpAddr]) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0)).await?;
        let local = listener.local_addr()?;

        let candidates: Vec<SocketAddr> = if candidate_ips.is_empty() {
            let ip = if local.ip().is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                local.ip()
            };
            vec![SocketAddr::new(ip, local.port())]
        } else {
            candidate_ips
                .iter()
                .map(|ip| SocketAddr::new(*ip, local.port()))
                .collect()
        };

        let token: [u8; TOKEN_LEN] = rand::random();
        let (channel, signals_tx) = Self::with_role(Role::Initiator);

        let offer = TcpSignal::Offer {
            token: hex::encode(token),
            candidates,
        };
        tracing::debug!("DIRECT [{}] offering {:?}", channel.outcome.tag, offer);
        signals_tx
            .send(serde_json::to_value(&offer)?)
            .map_err(|_| RelayError::Signalling("signal receiver dropped".to_string()))?;

        let task = tokio::spawn(accept_loop(channel.outcome.clone(), listener, token));
        lock(&channel.tasks).push(task);
        Ok(channel)
    }

    /// Channel that waits for an offer
    #[must_use]
    pub fn answerer() -> Self {
        Self::with_role(Role::Answerer).0
    }

    /// Role of this channel
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }
}

async fn accept_loop(outcome: Arc<Outcome>, listener: TcpListener, token: [u8; TOKEN_LEN]) {
    loop {
        let (mut socket, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                outcome.fail(format!("accept failed: {}", e));
                return;
            }
        };

        let verified = tokio::time::timeout(CANDIDATE_TIMEOUT, async {
            let mut received = [0u8; TOKEN_LEN];
            socket.read_exact(&mut received).await?;
            if received != token {
                return Ok::<bool, std::io::Error>(false);
            }
            socket.write_all(&[TOKEN_ACK]).await?;
            Ok(true)
        })
        .await;

        match verified {
            Ok(Ok(true)) => {
                let _ = socket.set_nodelay(true);
                outcome.establish(socket);
                return;
            }
            Ok(Ok(false)) => tracing::debug!("DIRECT [{}] wrong token from {}", outcome.tag, from),
            Ok(Err(e)) => tracing::debug!("DIRECT [{}] {} failed: {}", outcome.tag, from, e),
            Err(_) => tracing::debug!("DIRECT [{}] {} timed out", outcome.tag, from),
        }
    }
}

async fn try_candidate(addr: SocketAddr, token: [u8; TOKEN_LEN]) -> std::io::Result<TcpStream> {
    let attempt = async {
        let mut socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        socket.write_all(&token).await?;
        let mut ack = [0u8; 1];
        socket.read_exact(&mut ack).await?;
        if ack[0] != TOKEN_ACK {
            return Err(std::io::Error::other("token rejected"));
        }
        Ok(socket)
    };

    tokio::time::timeout(CANDIDATE_TIMEOUT, attempt)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "candidate timed out"))?
}

#[async_trait]
impl DirectChannel for TcpDirectChannel {
    async fn signal(&self, message: Value) -> Result<()> {
        let TcpSignal::Offer { token, candidates } = serde_json::from_value(message)?;

        if self.role != Role::Answerer {
            return Err(RelayError::Signalling(
                "initiator received an offer".to_string(),
            ));
        }
        if self.is_connected() || self.outcome.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }

        let token: [u8; TOKEN_LEN] = hex::decode(&token)
            .ok()
            .and_then(|t| t.try_into().ok())
            .ok_or_else(|| RelayError::Signalling("malformed token".to_string()))?;

        if candidates.is_empty() {
            self.outcome.fail("offer without candidates".to_string());
            return Ok(());
        }

        tracing::debug!("DIRECT [{}] dialing {:?}", self.outcome.tag, candidates);
        let outcome = self.outcome.clone();
        let task = tokio::spawn(async move {
            let attempts = candidates
                .into_iter()
                .map(|addr| Box::pin(try_candidate(addr, token)));
            match select_ok(attempts).await {
                Ok((socket, _)) => {
                    outcome.establish(socket);
                }
                Err(e) => outcome.fail(format!("no candidate reachable: {}", e)),
            }
        });
        lock(&self.tasks).push(task);
        Ok(())
    }

    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        lock(&self.signals_rx).take()
    }

    fn is_connected(&self) -> bool {
        self.outcome.connected.load(Ordering::Acquire)
    }

    fn take_established(&self) -> Option<oneshot::Receiver<Result<Stream>>> {
        lock(&self.established_rx).take()
    }

    fn destroy(&self) {
        if self.outcome.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(task) = lock(&self.outcome.stream_task).take() {
            task.abort();
        }
        self.outcome.fail("destroyed".to_string());
        tracing::debug!("DIRECT [{}] destroyed", self.outcome.tag);
    }
}

impl Drop for TcpDirectChannel {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Settings for [`TcpChannelFactory`]
#[derive(Debug, Clone)]
pub struct TcpChannelConfig {
    /// Address the initiator listens on
    pub bind_ip: IpAddr,
    /// Addresses offered to the counterparty, empty for the bound address
    pub candidate_ips: Vec<IpAddr>,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            candidate_ips: Vec::new(),
        }
    }
}

/// Creates [`TcpDirectChannel`]s
#[derive(Debug, Clone, Default)]
pub struct TcpChannelFactory {
    config: TcpChannelConfig,
}

impl TcpChannelFactory {
    /// Factory with the given settings
    #[must_use]
    pub fn new(config: TcpChannelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DirectChannelFactory for TcpChannelFactory {
    async fn outbound(&self) -> Result<Arc<dyn DirectChannel>> {
        let channel =
            TcpDirectChannel::initiator(self.config.bind_ip, &self.config.candidate_ips).await?;
        Ok(Arc::new(channel))
    }

    async fn inbound(&self) -> Result<Arc<dyn DirectChannel>> {
        Ok(Arc::new(TcpDirectChannel::answerer()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn connect_pair() -> (TcpDirectChannel, TcpDirectChannel) {
        let initiator = TcpDirectChannel::initiator(LOCALHOST, &[]).await.unwrap();
        let answerer = TcpDirectChannel::answerer();

        let mut signals = initiator.take_signals().unwrap();
        let offer = signals.recv().await.unwrap();
        answerer.signal(offer).await.unwrap();
        (initiator, answerer)
    }

    #[test]
    fn test_offer_json_shape() {
        let offer = TcpSignal::Offer {
            token: "00".repeat(TOKEN_LEN),
            candidates: vec!["127.0.0.1:4000".parse().unwrap()],
        };
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["candidates"][0], "127.0.0.1:4000");
        assert_eq!(serde_json::from_value::<TcpSignal>(json).unwrap(), offer);
    }

    #[tokio::test]
    async fn test_channels_connect() {
        let (initiator, answerer) = connect_pair().await;

        let mut a = initiator.take_established().unwrap().await.unwrap().unwrap();
        let mut b = answerer.take_established().unwrap().await.unwrap().unwrap();
        assert!(initiator.is_connected());
        assert!(answerer.is_connected());

        a.send(Bytes::from_static(b"direct")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"direct"));
        b.send(Bytes::from_static(b"back")).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"back"));
    }

    #[tokio::test]
    async fn test_wrong_token_is_ignored() {
        let initiator = TcpDirectChannel::initiator(LOCALHOST, &[]).await.unwrap();
        let mut signals = initiator.take_signals().unwrap();
        let TcpSignal::Offer { candidates, .. } =
            serde_json::from_value(signals.recv().await.unwrap()).unwrap();

        let result = try_candidate(candidates[0], [0xAA; TOKEN_LEN]).await;
        assert!(result.is_err());
        assert!(!initiator.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_candidates_fail() {
        let answerer = TcpDirectChannel::answerer();
        let established = answerer.take_established().unwrap();

        // Bind and drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let offer = TcpSignal::Offer {
            token: hex::encode([1u8; TOKEN_LEN]),
            candidates: vec![SocketAddr::new(LOCALHOST, port)],
        };
        answerer
            .signal(serde_json::to_value(&offer).unwrap())
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), established)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_initiator_rejects_offers() {
        let initiator = TcpDirectChannel::initiator(LOCALHOST, &[]).await.unwrap();
        let offer = TcpSignal::Offer {
            token: hex::encode([1u8; TOKEN_LEN]),
            candidates: Vec::new(),
        };
        assert!(
            initiator
                .signal(serde_json::to_value(&offer).unwrap())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_destroy_fails_pending() {
        let initiator = TcpDirectChannel::initiator(LOCALHOST, &[]).await.unwrap();
        let established = initiator.take_established().unwrap();
        initiator.destroy();
        assert!(established.await.unwrap().is_err());
    }
}
