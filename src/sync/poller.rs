//! Snapshot polling.
//!
//! [`SnapshotPoller`] performs one fetch for an identity: the aggregated
//! snapshot endpoint when the service has it, otherwise the per-concern
//! endpoints assembled into the same canonical shape. It also carries the
//! single-flight flag for its session context.
//!
//! [`spawn_ticker`] drives any periodic job (polling, telemetry flushes) the
//! same way: first tick immediately, missed ticks skipped, period changes
//! picked up from a watch channel, stopped by the shutdown broadcast.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::protocol::{self, PeerSnapshot};
use super::EngineResult;
use crate::connection::Identity;
use crate::transport::Transport;

/// Which endpoints produced a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSource {
    Aggregated,
    Fallback,
}

/// A successfully fetched and normalized snapshot
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub snapshot: PeerSnapshot,
    pub source: PollSource,
}

/// Clears the in-flight flag when the poll completes or is dropped
pub struct PollGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Fetches snapshots for one session context
pub struct SnapshotPoller {
    transport: Arc<dyn Transport>,
    snapshot_unavailable: AtomicBool,
    in_flight: AtomicBool,
}

impl SnapshotPoller {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            snapshot_unavailable: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Claim the single in-flight slot; `None` while another poll runs
    pub fn try_begin(&self) -> Option<PollGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollGuard {
                flag: &self.in_flight,
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether the aggregated endpoint was found missing
    pub fn uses_fallback(&self) -> bool {
        self.snapshot_unavailable.load(Ordering::Relaxed)
    }

    /// Fetch and normalize one snapshot
    pub async fn fetch(&self, identity: &Identity) -> EngineResult<PollOutcome> {
        if !self.uses_fallback() {
            match self.transport.snapshot(identity).await {
                Ok(value) => {
                    return Ok(PollOutcome {
                        snapshot: protocol::normalize_snapshot(&value, &identity.user_id)?,
                        source: PollSource::Aggregated,
                    });
                }
                Err(e) if e.is_endpoint_unavailable() => {
                    info!(
                        "Snapshot endpoint unavailable ({}), using per-concern fetches",
                        e
                    );
                    self.snapshot_unavailable.store(true, Ordering::Relaxed);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.fetch_parts(identity).await
    }

    async fn fetch_parts(&self, identity: &Identity) -> EngineResult<PollOutcome> {
        let (status, peers, requests) = tokio::try_join!(
            self.transport.user_status(identity),
            self.transport.list_peers(identity),
            self.transport.list_pairing_requests(identity),
        )?;

        Ok(PollOutcome {
            snapshot: protocol::snapshot_from_parts(&status, &peers, &requests, &identity.user_id)?,
            source: PollSource::Fallback,
        })
    }
}

fn ticker(period: Duration, start: Instant) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Spawn a periodic job. Each tick awaits `on_tick()` before the next one;
/// ticks missed meanwhile are skipped.
pub fn spawn_ticker<F, Fut>(
    name: &'static str,
    mut period_rx: watch::Receiver<Duration>,
    mut shutdown: broadcast::Receiver<()>,
    mut on_tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let period = *period_rx.borrow_and_update();
        let mut interval = ticker(period, Instant::now());
        debug!("{} task started, period {:?}", name, period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    on_tick().await;
                }
                changed = period_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let period = *period_rx.borrow_and_update();
                    debug!("{} period changed to {:?}", name, period);
                    interval = ticker(period, Instant::now() + period);
                }
                _ = shutdown.recv() => {
                    info!("{} task shutting down", name);
                    break;
                }
            }
        }
    })
}
