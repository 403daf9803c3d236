//! Relay-side registry of active circuits.
//!
//! There is at most one record per unordered pair of peers. A record is
//! removed exactly once, as soon as either of its legs closes or announces
//! an upgrade to a direct channel. Records carry a generation number so a
//! late event of a replaced record never removes its successor.

use crate::context::{DEFAULT_PING_TIMEOUT, LegStatus, RelayContext};
use crate::error::{RelayError, Result};
use futures::future::join_all;
use relaymesh_core::{PairKey, PeerId, Stream};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct Record {
    generation: u64,
    legs: [(PeerId, RelayContext); 2],
}

impl Record {
    fn leg(&self, peer: &PeerId) -> Option<&RelayContext> {
        self.legs
            .iter()
            .find(|(id, _)| id == peer)
            .map(|(_, ctx)| ctx)
    }
}

type Records = HashMap<PairKey, Record>;

/// Active relayed circuits of this node
#[derive(Debug, Clone)]
pub struct RelayState {
    records: Arc<RwLock<Records>>,
    generation: Arc<AtomicU64>,
    reserved: Arc<AtomicUsize>,
    relay_free_timeout: Duration,
}

/// A circuit slot held while a circuit is negotiated.
///
/// Counts against the capacity until the circuit is stored or the
/// reservation is dropped.
#[derive(Debug)]
pub struct SlotReservation {
    reserved: Arc<AtomicUsize>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl RelayState {
    /// Create an empty registry. `relay_free_timeout` delays freeing a slot
    /// after an upgrade.
    #[must_use]
    pub fn new(relay_free_timeout: Duration) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            reserved: Arc::new(AtomicUsize::new(0)),
            relay_free_timeout,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn leg_of(&self, source: PeerId, destination: PeerId, leg: &PeerId) -> Option<RelayContext> {
        let key = PairKey::new(source, destination).ok()?;
        self.read().get(&key)?.leg(leg).cloned()
    }

    /// Whether a circuit between the two peers is stored, alive or not
    #[must_use]
    pub fn exists(&self, source: PeerId, destination: PeerId) -> bool {
        PairKey::new(source, destination)
            .map(|key| self.read().contains_key(&key))
            .unwrap_or(false)
    }

    /// Whether the circuit exists and the destination answers a ping
    /// within `timeout`
    pub async fn is_active(&self, source: PeerId, destination: PeerId, timeout: Duration) -> bool {
        let Some(leg) = self.leg_of(source, destination, &destination) else {
            return false;
        };

        let rtt = leg.ping(timeout).await;
        tracing::debug!(
            "liveness of {} -> {}: {}",
            source.short(),
            destination.short(),
            rtt
        );
        rtt >= 0
    }

    /// Replace the stream towards `source` of an existing circuit.
    ///
    /// Returns false if there is no such circuit or it already closed.
    pub fn update_existing(&self, source: PeerId, destination: PeerId, to_source: Stream) -> bool {
        let Some(leg) = self.leg_of(source, destination, &source) else {
            return false;
        };

        match leg.update(to_source) {
            Ok(()) => {
                tracing::debug!(
                    "replaced stream of {} in circuit to {}",
                    source.short(),
                    destination.short()
                );
                true
            }
            Err(e) => {
                tracing::debug!("could not replace stream of {}: {}", source.short(), e);
                false
            }
        }
    }

    /// Reserve a slot unless stored circuits and outstanding reservations
    /// already reach `capacity`
    #[must_use]
    pub fn try_reserve(&self, capacity: usize) -> Option<SlotReservation> {
        // The write lock serializes reservations against each other and
        // against stores
        let records = self.write();
        if records.len() + self.reserved.load(Ordering::Acquire) >= capacity {
            return None;
        }
        self.reserved.fetch_add(1, Ordering::AcqRel);
        Some(SlotReservation {
            reserved: self.reserved.clone(),
        })
    }

    /// Wire two streams into a new circuit.
    ///
    /// Resolves once both legs stopped pumping.
    ///
    /// # Errors
    ///
    /// Returns an error for loopbacks or if a leg terminated abnormally.
    pub async fn create_new(
        &self,
        source: PeerId,
        destination: PeerId,
        to_source: Stream,
        to_destination: Stream,
    ) -> Result<()> {
        self.create(source, destination, to_source, to_destination, None)
            .await
    }

    /// [`RelayState::create_new`] for a circuit holding `slot`, which is
    /// released as the circuit is stored.
    ///
    /// # Errors
    ///
    /// Returns an error for loopbacks or if a leg terminated abnormally.
    pub async fn create_reserved(
        &self,
        slot: SlotReservation,
        source: PeerId,
        destination: PeerId,
        to_source: Stream,
        to_destination: Stream,
    ) -> Result<()> {
        self.create(source, destination, to_source, to_destination, Some(slot))
            .await
    }

    async fn create(
        &self,
        source: PeerId,
        destination: PeerId,
        to_source: Stream,
        to_destination: Stream,
        slot: Option<SlotReservation>,
    ) -> Result<()> {
        let key = PairKey::new(source, destination)?;

        let (ctx_source, relayed_source) = RelayContext::new(to_source, self.relay_free_timeout);
        let (ctx_destination, relayed_destination) =
            RelayContext::new(to_destination, self.relay_free_timeout);

        let source_done = ctx_source.attach(relayed_destination);
        let destination_done = ctx_destination.attach(relayed_source);

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let replaced = {
            let mut records = self.write();
            let replaced = records.insert(
                key,
                Record {
                    generation,
                    legs: [
                        (source, ctx_source.clone()),
                        (destination, ctx_destination.clone()),
                    ],
                },
            );
            drop(slot);
            replaced
        };
        if let Some(old) = replaced {
            tracing::debug!("replacing stale circuit {}", key);
            tokio::spawn(async move {
                for (_, leg) in old.legs {
                    leg.close().await;
                }
            });
        }
        tracing::info!("relaying {}", key);

        let mut source_status = ctx_source.subscribe();
        let mut destination_status = ctx_destination.subscribe();
        let state = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = wait_released(&mut source_status) => {}
                () = wait_released(&mut destination_status) => {}
            }
            state.remove_generation(&key, generation);
        });

        let (source_result, destination_result) = tokio::join!(source_done, destination_done);
        source_result.unwrap_or(Err(RelayError::StreamClosed))?;
        destination_result.unwrap_or(Err(RelayError::StreamClosed))?;

        tracing::debug!("circuit {} ended", key);
        Ok(())
    }

    fn remove_generation(&self, key: &PairKey, generation: u64) {
        let mut records = self.write();
        if records.get(key).is_some_and(|r| r.generation == generation) {
            records.remove(key);
            tracing::debug!("removed circuit {}", key);
        }
    }

    /// Number of stored circuits, stale ones included
    #[must_use]
    pub fn size(&self) -> usize {
        self.read().len()
    }

    /// Ping both legs of every circuit and drop those where either leg does
    /// not answer. Returns the number of dropped circuits.
    pub async fn prune(&self) -> usize {
        let snapshot: Vec<(PairKey, Record)> = self
            .read()
            .iter()
            .map(|(key, record)| (*key, record.clone()))
            .collect();

        let checks = snapshot.into_iter().map(|(key, record)| async move {
            let [(_, a), (_, b)] = &record.legs;
            let (rtt_a, rtt_b) = tokio::join!(a.ping(DEFAULT_PING_TIMEOUT), b.ping(DEFAULT_PING_TIMEOUT));
            (key, record, rtt_a >= 0 && rtt_b >= 0)
        });

        let mut pruned = 0;
        for (key, record, alive) in join_all(checks).await {
            if alive {
                continue;
            }
            pruned += 1;
            self.remove_generation(&key, record.generation);
            for (_, leg) in &record.legs {
                leg.close().await;
            }
        }

        if pruned > 0 {
            tracing::info!("pruned {} stale circuits", pruned);
        }
        pruned
    }

    /// Drop a circuit without checking whether it is alive
    pub fn remove(&self, source: PeerId, destination: PeerId) {
        if let Ok(key) = PairKey::new(source, destination) {
            self.write().remove(&key);
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RelayState:")?;
        let records = self.read();
        if records.is_empty() {
            return write!(f, "  No relayed connections");
        }
        let lines: Vec<String> = records.keys().map(|key| format!("  {}", key)).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

async fn wait_released(status: &mut watch::Receiver<LegStatus>) {
    let _ = status.wait_for(|s| *s != LegStatus::Open).await;
}
