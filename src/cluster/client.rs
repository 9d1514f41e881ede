//! Cluster client.
//!
//! [`ClusterClient`] ties the pieces together: it bootstraps the partition
//! table from the seeds, routes commands through the [`Router`], and owns the
//! [`RefreshScheduler`] that keeps the table current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::info;

use crate::core::command::{self, Cmd};
use crate::core::connection::TcpConnector;
use crate::core::{Connector, Error, Result};
use crate::proto::frame::Frame;

use super::options::{ClusterClientBuilder, ClusterOptions};
use super::partitions::{PartitionTable, Partitions};
use super::pool::ConnectionPool;
use super::refresh::TopologyRefresher;
use super::router::{Routed, Router};
use super::scheduler::{RefreshScheduler, SchedulerState, Topology};

#[derive(Debug)]
struct ClusterInner {
    topology: Topology,
    router: Router,
    scheduler: RefreshScheduler,
    closed: AtomicBool,
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

/// Cluster client.
///
/// Cheap to clone; clones share the partition table, the connection pool and
/// the refresh loop. Dropping the last clone stops the refresh loop.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> slotwise::Result<()> {
/// use slotwise::ClusterClient;
///
/// let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
/// client.set("key", "value").await?;
/// let value = client.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
}

impl ClusterClient {
    /// Connects over TCP using default options.
    ///
    /// # Arguments
    ///
    /// * `addresses` - Comma-separated seed addresses (e.g. `"127.0.0.1:7000,127.0.0.1:7001"`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for bad addresses and
    /// [`Error::BootstrapFailure`] if no seed answers.
    pub async fn connect(addresses: &str) -> Result<Self> {
        ClusterClientBuilder::new().seeds(addresses).build().await
    }

    /// Returns a builder for custom options.
    pub fn builder() -> ClusterClientBuilder {
        ClusterClientBuilder::new()
    }

    /// Connects over TCP with `options`.
    pub async fn with_options(options: ClusterOptions) -> Result<Self> {
        Self::with_connector(options, Arc::new(TcpConnector::default())).await
    }

    /// Connects with `options`, opening node connections through `connector`.
    ///
    /// Loads the initial partitions before returning and starts the refresh
    /// loop when periodic refresh is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BootstrapFailure`] if no seed answers.
    pub async fn with_connector(options: ClusterOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        options.validate()?;
        let options = Arc::new(options);
        let table = Arc::new(PartitionTable::new());
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&connector),
            options.connect_timeout,
        ));
        let topology = Topology::new(
            Arc::clone(&options),
            Arc::clone(&table),
            Arc::clone(&pool),
            TopologyRefresher::new(connector, options.connect_timeout),
        );
        topology.bootstrap().await?;

        let wake = Arc::new(Notify::new());
        let router = Router::new(table, pool, Arc::clone(&options), Arc::clone(&wake));
        let scheduler = RefreshScheduler::new(options.periodic_refresh, options.refresh_interval, wake);
        scheduler.activate(topology.clone());

        Ok(Self {
            inner: Arc::new(ClusterInner {
                topology,
                router,
                scheduler,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// The options the client was built with.
    pub fn options(&self) -> &ClusterOptions {
        &self.inner.topology.options
    }

    /// The current partition snapshot.
    pub fn partitions(&self) -> Arc<Partitions> {
        self.inner.topology.table.snapshot()
    }

    /// Refreshes the partitions now.
    ///
    /// Returns whether the topology changed. On change, connections to nodes
    /// that left are closed in the background.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RefreshFailure`] if no known node answers; the
    /// partitions are left unchanged.
    pub async fn reload_partitions(&self) -> Result<bool> {
        self.ensure_open()?;
        self.inner.topology.reload().await
    }

    /// Sends `cmd` to the node owning its slot and follows redirects.
    ///
    /// # Errors
    ///
    /// See [`Router::route`]. After [`shutdown`](Self::shutdown) every call
    /// fails with [`Error::Shutdown`].
    pub async fn route(&self, cmd: Cmd) -> Result<Routed> {
        self.ensure_open()?;
        self.inner.router.route(cmd).await
    }

    /// Sends `cmd` and returns only its reply.
    pub async fn query(&self, cmd: Cmd) -> Result<Frame> {
        Ok(self.route(cmd).await?.reply)
    }

    /// Stops the refresh loop and closes every pooled connection.
    ///
    /// Commands already in flight fail as their connection closes.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.scheduler.shutdown();
        self.inner.topology.pool.close_all();
        info!("cluster client shut down");
    }

    /// Turns the periodic refresh on or off.
    ///
    /// Enabling it starts the refresh loop if it never ran.
    pub fn set_periodic_refresh(&self, enabled: bool) {
        self.inner.scheduler.set_enabled(enabled);
        if enabled && !self.inner.closed.load(Ordering::Acquire) {
            self.inner.scheduler.activate(self.inner.topology.clone());
        }
    }

    /// State of the refresh loop.
    pub fn scheduler_state(&self) -> SchedulerState {
        self.inner.scheduler.state()
    }

    /// Number of nodes in the current partitions.
    pub fn node_count(&self) -> usize {
        self.partitions().len()
    }

    /// Number of open pooled connections.
    pub fn connection_count(&self) -> usize {
        self.inner.topology.pool.count()
    }

    /// Pings a node.
    pub async fn ping(&self) -> Result<()> {
        match self.query(command::ping()).await? {
            Frame::SimpleString(_) => Ok(()),
            other => Err(unexpected("PING", &other)),
        }
    }

    /// Gets the value of `key`.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        match self.query(command::get(key)).await? {
            Frame::BulkString(data) => Ok(data),
            Frame::Null => Ok(None),
            other => Err(unexpected("GET", &other)),
        }
    }

    /// Sets `key` to `value`.
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        match self.query(command::set(key, value)).await? {
            Frame::SimpleString(_) => Ok(()),
            other => Err(unexpected("SET", &other)),
        }
    }

    /// Deletes `key`. Returns the number of keys removed.
    pub async fn del(&self, key: impl Into<Bytes>) -> Result<i64> {
        match self.query(command::del(key)).await? {
            Frame::Integer(n) => Ok(n),
            other => Err(unexpected("DEL", &other)),
        }
    }

    /// True if `key` exists.
    pub async fn exists(&self, key: impl Into<Bytes>) -> Result<bool> {
        match self.query(command::exists(key)).await? {
            Frame::Integer(n) => Ok(n > 0),
            other => Err(unexpected("EXISTS", &other)),
        }
    }
}

fn unexpected(command: &str, reply: &Frame) -> Error {
    Error::Protocol {
        message: format!("unexpected response type for {}: {:?}", command, reply),
    }
}
