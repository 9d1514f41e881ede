//! Connection pooling for cluster nodes.
//!
//! One connection per distinct node address, opened lazily and shared by
//! every caller that targets that node. Pipelining multiplexes concurrent
//! commands on the same socket, so there is no per-node connection limit.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::core::{open_connection, Connection, Connector, Endpoint, Error, Result};

use super::topology::NodeDescriptor;

/// A pooled connection slot for one address.
///
/// The cell is filled by the first successful connect; concurrent callers
/// for the same address wait on the same attempt.
#[derive(Debug)]
struct PoolEntry {
    connection: OnceCell<Arc<dyn Connection>>,
    uses: AtomicU64,
}

impl PoolEntry {
    fn new() -> Self {
        Self {
            connection: OnceCell::new(),
            uses: AtomicU64::new(0),
        }
    }

    /// True if the entry holds a connection that went away.
    fn is_dead(&self) -> bool {
        self.connection.get().is_some_and(|c| c.is_closed())
    }

    fn close(&self) {
        if let Some(connection) = self.connection.get() {
            connection.close();
        }
    }
}

/// Connection pool for cluster nodes, keyed by `host:port`.
#[derive(Debug)]
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    entries: Mutex<HashMap<String, Arc<PoolEntry>>>,
}

impl ConnectionPool {
    /// Creates an empty pool.
    ///
    /// # Arguments
    ///
    /// * `connector` - Opens raw connections.
    /// * `connect_timeout` - Bound on connect plus authentication.
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<PoolEntry>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the connection for `node`, opening it on first use.
    pub async fn get_for(&self, node: &NodeDescriptor) -> Result<Arc<dyn Connection>> {
        self.get(&node.endpoint).await
    }

    /// Returns the connection for `endpoint`, opening it on first use.
    ///
    /// A connection that has closed since it was cached is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] when the node cannot be reached or
    /// rejects the credential. Other pool entries are left untouched.
    pub async fn get(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>> {
        let address = endpoint.address();
        let entry = {
            let mut entries = self.entries();
            match entries.get(&address) {
                Some(entry) if !entry.is_dead() => Arc::clone(entry),
                stale => {
                    if stale.is_some() {
                        debug!(address = %address, "replacing closed connection");
                    }
                    let entry = Arc::new(PoolEntry::new());
                    entries.insert(address.clone(), Arc::clone(&entry));
                    entry
                }
            }
        };

        let opened = entry
            .connection
            .get_or_try_init(|| async {
                debug!(address = %address, "opening connection");
                open_connection(self.connector.as_ref(), endpoint, self.connect_timeout).await
            })
            .await;
        let connection = match opened {
            Ok(connection) => connection,
            Err(e) => {
                let mut entries = self.entries();
                if entries.get(&address).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                    entries.remove(&address);
                }
                return Err(Error::connection(address.as_str(), e));
            }
        };

        entry.uses.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(connection))
    }

    /// Closes and evicts every connection whose address is not in `nodes`.
    ///
    /// Returns the number of evicted entries.
    pub fn close_stale(&self, nodes: &[Arc<NodeDescriptor>]) -> usize {
        let live: HashSet<String> = nodes.iter().map(|n| n.endpoint.address()).collect();
        let stale: Vec<(String, Arc<PoolEntry>)> = {
            let mut entries = self.entries();
            let addresses: Vec<String> = entries
                .keys()
                .filter(|a| !live.contains(*a))
                .cloned()
                .collect();
            addresses
                .into_iter()
                .filter_map(|a| entries.remove(&a).map(|e| (a, e)))
                .collect()
        };

        for (address, entry) in &stale {
            info!(
                address = %address,
                uses = entry.uses.load(Ordering::Relaxed),
                "closing connection to node no longer in topology"
            );
            entry.close();
        }
        stale.len()
    }

    /// Closes every pooled connection and empties the pool.
    pub fn close_all(&self) {
        let drained: Vec<Arc<PoolEntry>> = self.entries().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.close();
        }
    }

    /// Number of open pooled connections.
    pub fn count(&self) -> usize {
        self.entries()
            .values()
            .filter(|e| e.connection.initialized() && !e.is_dead())
            .count()
    }

    /// Addresses with an open pooled connection, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, e)| e.connection.initialized() && !e.is_dead())
            .map(|(a, _)| a.clone())
            .collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCluster;

    fn pool_for(cluster: &MockCluster) -> ConnectionPool {
        ConnectionPool::new(cluster.connector(), Duration::from_secs(1))
    }

    fn node(id: &str, port: u16) -> Arc<NodeDescriptor> {
        Arc::new(NodeDescriptor::new(id, Endpoint::new("127.0.0.1", port), []))
    }

    #[tokio::test]
    async fn test_get_reuses_connection() {
        let cluster = MockCluster::new();
        cluster.add_node("n1", 7000);
        let pool = pool_for(&cluster);
        let endpoint = Endpoint::new("127.0.0.1", 7000);

        let a = pool.get(&endpoint).await.unwrap();
        let b = pool.get(&endpoint).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.count(), 1);
        assert_eq!(cluster.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_shares_one_attempt() {
        let cluster = MockCluster::new();
        cluster.add_node("n1", 7000);
        let pool = Arc::new(pool_for(&cluster));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.get(&Endpoint::new("127.0.0.1", 7000)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cluster.connect_count(), 1);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_evict_others() {
        let cluster = MockCluster::new();
        cluster.add_node("n1", 7000);
        let pool = pool_for(&cluster);

        pool.get(&Endpoint::new("127.0.0.1", 7000)).await.unwrap();
        let result = pool.get(&Endpoint::new("127.0.0.1", 7999)).await;
        match result {
            Err(Error::Connection { address, .. }) => assert_eq!(address, "127.0.0.1:7999"),
            other => panic!("expected Connection error, got {:?}", other),
        }
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.addresses(), vec!["127.0.0.1:7000"]);
        assert_eq!(pool.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_entry() {
        let cluster = MockCluster::new();
        cluster.add_node("n1", 7000);
        cluster.set_unreachable("n1", true);
        let pool = pool_for(&cluster);
        let endpoint = Endpoint::new("127.0.0.1", 7000);

        for port in 7001..7005 {
            assert!(pool.get(&Endpoint::new("127.0.0.1", port)).await.is_err());
        }
        assert!(pool.get(&endpoint).await.is_err());
        assert!(pool.entries().is_empty());

        cluster.set_unreachable("n1", false);
        pool.get(&endpoint).await.unwrap();
        assert_eq!(pool.entries().len(), 1);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn test_close_stale() {
        let cluster = MockCluster::new();
        cluster.add_node("n1", 7000);
        cluster.add_node("n2", 7001);
        let pool = pool_for(&cluster);

        let kept = pool.get(&Endpoint::new("127.0.0.1", 7000)).await.unwrap();
        let evicted = pool.get(&Endpoint::new("127.0.0.1", 7001)).await.unwrap();
        assert_eq!(pool.count(), 2);

        let closed = pool.close_stale(&[node("n1", 7000)]);
        assert_eq!(closed, 1);
        assert_eq!(pool.count(), 1);
        assert!(evicted.is_closed());
        assert!(!kept.is_closed());
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let cluster = MockCluster::new();
        cluster.add_node("n1", 7000);
        let pool = pool_for(&cluster);
        let endpoint = Endpoint::new("127.0.0.1", 7000);

        let first = pool.get(&endpoint).await.unwrap();
        first.close();
        assert_eq!(pool.count(), 0);

        let second = pool.get(&endpoint).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cluster.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_authenticates_new_connections() {
        let cluster = MockCluster::with_password("secret");
        cluster.add_node("n1", 7000);
        let pool = pool_for(&cluster);

        let wrong = Endpoint::new("127.0.0.1", 7000).with_credentials(None, Some("nope".into()));
        match pool.get(&wrong).await {
            Err(Error::Connection { source, .. }) => assert!(matches!(*source, Error::Auth)),
            other => panic!("expected auth failure, got {:?}", other),
        }

        let right = Endpoint::new("127.0.0.1", 7000).with_credentials(None, Some("secret".into()));
        let conn = pool.get(&right).await.unwrap();
        let reply = conn.submit(crate::core::command::get("A")).await.unwrap();
        assert!(reply.is_null());
    }

    #[tokio::test]
    async fn test_close_all() {
        let cluster = MockCluster::new();
        cluster.add_node("n1", 7000);
        let pool = pool_for(&cluster);
        let conn = pool.get(&Endpoint::new("127.0.0.1", 7000)).await.unwrap();

        pool.close_all();
        assert_eq!(pool.count(), 0);
        assert!(conn.is_closed());
    }
}
