//! Background topology refresh.
//!
//! [`RefreshScheduler`] owns at most one refresh loop per client. The loop
//! wakes on a fixed interval (or early, when the router saw a `MOVED`),
//! reloads the topology and, if it changed, swaps the partition table and
//! spawns a separate task that evicts connections to departed nodes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::{Endpoint, Error, Result};

use super::options::ClusterOptions;
use super::partitions::PartitionTable;
use super::pool::ConnectionPool;
use super::refresh::{canonical, is_changed, TopologyRefresher};

/// Lifecycle state of a [`RefreshScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No refresh loop has been started.
    Inactive,
    /// The refresh loop is running.
    Active,
}

/// The shared state a refresh round reads and replaces.
///
/// Clones share one write lock: at most one bootstrap or reload round runs
/// at a time, so a slow round cannot publish a view older than the table.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    pub(crate) options: Arc<ClusterOptions>,
    pub(crate) table: Arc<PartitionTable>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) refresher: TopologyRefresher,
    writer: Arc<AsyncMutex<()>>,
}

impl Topology {
    pub(crate) fn new(
        options: Arc<ClusterOptions>,
        table: Arc<PartitionTable>,
        pool: Arc<ConnectionPool>,
        refresher: TopologyRefresher,
    ) -> Self {
        Self {
            options,
            table,
            pool,
            refresher,
            writer: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Addresses of every known node, or the bootstrap seeds while the table
    /// is empty.
    fn refresh_seeds(&self) -> Vec<Endpoint> {
        let partitions = self.table.snapshot();
        if partitions.is_empty() {
            return self.options.seeds.clone();
        }
        partitions.nodes().iter().map(|n| n.endpoint.clone()).collect()
    }

    /// Loads the first view from the bootstrap seeds into the table.
    pub(crate) async fn bootstrap(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let views = match self.refresher.load_views(&self.options.seeds).await {
            Ok(views) => views,
            Err(Error::RefreshFailure { seeds }) => return Err(Error::BootstrapFailure { seeds }),
            Err(e) => return Err(e),
        };
        let Some(view) = canonical(views) else {
            return Err(Error::BootstrapFailure {
                seeds: self.options.seeds.iter().map(Endpoint::address).collect(),
            });
        };
        info!(seed = %view.viewed_by, nodes = view.nodes.len(), "loaded initial partitions");
        self.table.replace(view.nodes);
        Ok(())
    }

    /// Runs one refresh round. Returns whether the table was replaced.
    ///
    /// On change, stale connections are evicted from a spawned task so
    /// commands already holding them finish first.
    pub(crate) async fn reload(&self) -> Result<bool> {
        let _writer = self.writer.lock().await;
        let seeds = self.refresh_seeds();
        let views = self.refresher.load_views(&seeds).await?;
        let Some(view) = canonical(views) else {
            return Ok(false);
        };
        let seed = view.viewed_by.clone();

        if !is_changed(&self.table.snapshot(), &view) {
            debug!(seed = %seed, "topology unchanged");
            return Ok(false);
        }

        let partitions = self.table.replace(view.nodes);
        info!(seed = %seed, nodes = partitions.len(), "partitions changed");

        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let closed = pool.close_stale(partitions.nodes());
            if closed > 0 {
                debug!(closed, "evicted stale connections");
            }
        });
        Ok(true)
    }
}

/// Runs the periodic refresh loop of one client.
#[derive(Debug)]
pub struct RefreshScheduler {
    interval: Duration,
    enabled: Arc<AtomicBool>,
    active: AtomicBool,
    stopped: AtomicBool,
    wake: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    /// Creates an inactive scheduler.
    ///
    /// # Arguments
    ///
    /// * `enabled` - Whether rounds run once active.
    /// * `interval` - Time between rounds.
    /// * `wake` - Notified to request a round before the interval elapses.
    pub fn new(enabled: bool, interval: Duration, wake: Arc<Notify>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            interval,
            enabled: Arc::new(AtomicBool::new(enabled)),
            active: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            wake,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        if self.active.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire) {
            SchedulerState::Active
        } else {
            SchedulerState::Inactive
        }
    }

    /// Whether scheduled rounds do any work.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turns scheduled rounds on or off. The loop keeps running either way.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Starts the refresh loop if it is enabled and not yet started.
    ///
    /// Returns `true` only for the call that started the loop.
    pub(crate) fn activate(&self, topology: Topology) -> bool {
        if !self.is_enabled() || self.stopped.load(Ordering::Acquire) {
            return false;
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let handle = tokio::spawn(run(
            topology,
            self.interval,
            Arc::clone(&self.enabled),
            Arc::clone(&self.wake),
            self.shutdown_tx.subscribe(),
        ));
        let mut guard = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.stopped.load(Ordering::Acquire) {
            // Lost a race with `shutdown`.
            handle.abort();
            return false;
        }
        *guard = Some(handle);
        drop(guard);
        info!(interval_ms = self.interval.as_millis() as u64, "topology refresh scheduled");
        true
    }

    /// Stops the loop. The scheduler never becomes active again.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            debug!("topology refresh stopped");
        }
    }
}

async fn run(
    topology: Topology,
    period: Duration,
    enabled: Arc<AtomicBool>,
    wake: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {}
            _ = wake.notified() => debug!("refresh requested"),
        }
        if !enabled.load(Ordering::Acquire) {
            continue;
        }
        if let Err(e) = topology.reload().await {
            warn!(error = %e, "topology refresh failed, keeping current partitions");
        }
    }
}
