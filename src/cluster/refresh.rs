//! Topology discovery.
//!
//! Seeds are queried concurrently with `CLUSTER NODES`. A seed that fails or
//! misses the deadline is skipped; the round only fails when no seed answers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::{open_connection, Connector, Endpoint, Error, Result};
use crate::proto::frame::Frame;

use super::commands;
use super::partitions::Partitions;
use super::redirect::server_error;
use super::topology::{ClusterView, NodeFlags, NodeId};

/// Loads cluster views from seed nodes.
#[derive(Debug, Clone)]
pub struct TopologyRefresher {
    connector: Arc<dyn Connector>,
    timeout: Duration,
}

impl TopologyRefresher {
    /// Creates a refresher.
    ///
    /// # Arguments
    ///
    /// * `connector` - Opens the short-lived query connections.
    /// * `timeout` - Deadline shared by all seeds of one round.
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    /// Asks one node for its view of the cluster.
    ///
    /// The query runs on a dedicated connection that is closed afterwards,
    /// so it never queues behind commands on pooled connections.
    pub async fn query_node(&self, seed: &Endpoint) -> Result<ClusterView> {
        let connection = open_connection(self.connector.as_ref(), seed, self.timeout).await?;
        let reply = tokio::time::timeout(self.timeout, connection.submit(commands::cluster_nodes())).await;
        connection.close();

        let reply = reply.map_err(|_| Error::Timeout {
            millis: self.timeout.as_millis() as u64,
        })??;
        match reply {
            Frame::BulkString(Some(text)) | Frame::SimpleString(text) => {
                let text = std::str::from_utf8(&text).map_err(|_| Error::Protocol {
                    message: "CLUSTER NODES reply is not UTF-8".to_string(),
                })?;
                ClusterView::from_cluster_nodes(seed.clone(), text)
            }
            Frame::Error(message) => Err(server_error(&message)),
            other => Err(Error::Protocol {
                message: format!("unexpected CLUSTER NODES reply: {:?}", other),
            }),
        }
    }

    /// Queries every seed concurrently and returns the views that arrived
    /// before the deadline, in arrival order.
    ///
    /// Duplicate seed addresses are queried once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RefreshFailure`] if no seed produced a view.
    pub async fn load_views(&self, seeds: &[Endpoint]) -> Result<Vec<ClusterView>> {
        let mut seen = HashSet::new();
        let seeds: Vec<&Endpoint> = seeds.iter().filter(|s| seen.insert(s.address())).collect();
        let deadline = Instant::now() + self.timeout;

        let mut pending: FuturesUnordered<_> = seeds
            .iter()
            .map(|&seed| async move {
                let result = match tokio::time::timeout_at(deadline, self.query_node(seed)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        millis: self.timeout.as_millis() as u64,
                    }),
                };
                (seed, result)
            })
            .collect();

        let mut views = Vec::with_capacity(seeds.len());
        while let Some((seed, result)) = pending.next().await {
            match result {
                Ok(view) => {
                    debug!(seed = %seed, nodes = view.nodes.len(), "loaded cluster view");
                    views.push(view);
                }
                Err(e) => warn!(seed = %seed, error = %e, "seed did not answer topology query"),
            }
        }

        if views.is_empty() {
            return Err(Error::RefreshFailure {
                seeds: seeds.iter().map(|s| s.address()).collect(),
            });
        }
        Ok(views)
    }
}

/// Picks the canonical view: the first one that arrived.
pub fn canonical(views: Vec<ClusterView>) -> Option<ClusterView> {
    views.into_iter().next()
}

/// Returns the seed that produced `chosen`, if it is one of `views`.
pub fn viewed_by<'a>(views: &'a [ClusterView], chosen: &ClusterView) -> Option<&'a Endpoint> {
    views
        .iter()
        .find(|v| v.viewed_by.address() == chosen.viewed_by.address())
        .map(|v| &v.viewed_by)
}

/// True if `new` differs from `old` in membership, addresses, slots, flags or
/// replication (`replica_of`).
///
/// The `myself` flag is ignored: it only names the seed that answered.
pub fn is_changed(old: &Partitions, new: &ClusterView) -> bool {
    type Summary<'a> = BTreeMap<&'a str, (String, NodeFlags, Option<&'a NodeId>, &'a [u16])>;

    let before: Summary<'_> = old
        .nodes()
        .iter()
        .map(|n| {
            (
                n.id.as_str(),
                (
                    n.endpoint.address(),
                    n.flags.without_myself(),
                    n.replica_of.as_ref(),
                    n.slots.as_slice(),
                ),
            )
        })
        .collect();
    let after: Summary<'_> = new
        .nodes
        .iter()
        .map(|n| {
            (
                n.id.as_str(),
                (
                    n.endpoint.address(),
                    n.flags.without_myself(),
                    n.replica_of.as_ref(),
                    n.slots.as_slice(),
                ),
            )
        })
        .collect();
    before != after
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCluster;

    fn refresher(cluster: &MockCluster) -> TopologyRefresher {
        TopologyRefresher::new(cluster.connector(), Duration::from_secs(1))
    }

    fn two_node_cluster() -> MockCluster {
        let cluster = MockCluster::new();
        cluster.add_node("node1", 7000);
        cluster.add_node("node2", 7001);
        cluster.meet("node1", "node2");
        cluster.add_slots("node1", 0..6000);
        cluster.add_slots("node2", 6000..16384);
        cluster
    }

    #[tokio::test]
    async fn test_query_node() {
        let cluster = two_node_cluster();
        let view = refresher(&cluster)
            .query_node(&Endpoint::new("127.0.0.1", 7000))
            .await
            .unwrap();
        assert_eq!(view.viewed_by.address(), "127.0.0.1:7000");
        assert_eq!(view.nodes.len(), 2);
        let me = view.nodes.iter().find(|n| n.flags.myself).unwrap();
        assert_eq!(me.id.as_str(), "node1");
        assert_eq!(me.slots.len(), 6000);
        // The query connection is not kept.
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_load_views_skips_failed_seeds() {
        let cluster = two_node_cluster();
        cluster.set_unreachable("node1", true);
        let seeds = vec![
            Endpoint::new("127.0.0.1", 7000),
            Endpoint::new("127.0.0.1", 7001),
            Endpoint::new("127.0.0.1", 7999),
        ];
        let views = refresher(&cluster).load_views(&seeds).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].viewed_by.address(), "127.0.0.1:7001");
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_views_unresponsive_seed_does_not_stall() {
        let cluster = two_node_cluster();
        cluster.set_unresponsive("node1", true);
        let seeds = vec![Endpoint::new("127.0.0.1", 7000), Endpoint::new("127.0.0.1", 7001)];

        let started = Instant::now();
        let views = refresher(&cluster).load_views(&seeds).await.unwrap();
        assert_eq!(views.len(), 1);
        assert!(started.elapsed() <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_load_views_all_seeds_fail() {
        let cluster = two_node_cluster();
        let seeds = vec![Endpoint::new("127.0.0.1", 8000), Endpoint::new("127.0.0.1", 8001)];
        match refresher(&cluster).load_views(&seeds).await {
            Err(Error::RefreshFailure { seeds }) => {
                assert_eq!(seeds, vec!["127.0.0.1:8000", "127.0.0.1:8001"]);
            }
            other => panic!("expected RefreshFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_views_dedups_seeds() {
        let cluster = two_node_cluster();
        let seeds = vec![Endpoint::new("127.0.0.1", 7000), Endpoint::new("127.0.0.1", 7000)];
        let views = refresher(&cluster).load_views(&seeds).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(cluster.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_canonical_and_viewed_by() {
        let cluster = two_node_cluster();
        let seeds = vec![Endpoint::new("127.0.0.1", 7000), Endpoint::new("127.0.0.1", 7001)];
        let views = refresher(&cluster).load_views(&seeds).await.unwrap();
        let chosen = canonical(views.clone()).unwrap();
        let seed = viewed_by(&views, &chosen).unwrap();
        assert_eq!(seed.address(), views[0].viewed_by.address());
    }

    #[tokio::test]
    async fn test_empty_host_takes_seed_host() {
        let cluster = MockCluster::new();
        cluster.add_node("solo", 7000);
        cluster.hide_host("solo");
        let view = refresher(&cluster)
            .query_node(&Endpoint::new("127.0.0.1", 7000))
            .await
            .unwrap();
        assert_eq!(view.nodes[0].endpoint.address(), "127.0.0.1:7000");
    }

    #[tokio::test]
    async fn test_is_changed() {
        let cluster = two_node_cluster();
        let refresher = refresher(&cluster);
        let from_node1 = refresher.query_node(&Endpoint::new("127.0.0.1", 7000)).await.unwrap();
        let partitions = Partitions::new(from_node1.nodes.clone());

        // Same topology seen from another node: only `myself` moved.
        let from_node2 = refresher.query_node(&Endpoint::new("127.0.0.1", 7001)).await.unwrap();
        assert!(!is_changed(&partitions, &from_node2));

        cluster.move_slot(6373, "node2", "node1");
        let moved = refresher.query_node(&Endpoint::new("127.0.0.1", 7001)).await.unwrap();
        assert!(is_changed(&partitions, &moved));

        cluster.forget("node2");
        let shrunk = refresher.query_node(&Endpoint::new("127.0.0.1", 7000)).await.unwrap();
        assert!(is_changed(&partitions, &shrunk));
    }

    #[tokio::test]
    async fn test_is_changed_on_flags_alone() {
        let cluster = two_node_cluster();
        let refresher = refresher(&cluster);
        let seed = Endpoint::new("127.0.0.1", 7000);
        let partitions = Partitions::new(refresher.query_node(&seed).await.unwrap().nodes);

        cluster.set_flags("node2", &["fail?"]);
        let failing = refresher.query_node(&seed).await.unwrap();
        assert!(failing.nodes.iter().any(|n| n.flags.pfail));
        assert!(is_changed(&partitions, &failing));

        cluster.set_flags("node2", &[]);
        let recovered = refresher.query_node(&seed).await.unwrap();
        assert!(!is_changed(&partitions, &recovered));
    }

    #[tokio::test]
    async fn test_is_changed_on_failover() {
        let cluster = two_node_cluster();
        cluster.add_node("node3", 7002);
        cluster.meet("node1", "node3");
        cluster.set_replica_of("node3", Some("node1"));
        let refresher = refresher(&cluster);
        let seed = Endpoint::new("127.0.0.1", 7000);
        let partitions = Partitions::new(refresher.query_node(&seed).await.unwrap().nodes);
        let replica = partitions.node_by_id(&NodeId::new("node3")).unwrap();
        assert!(replica.is_replica());
        assert_eq!(replica.replica_of, Some(NodeId::new("node1")));

        // Same role, different primary.
        cluster.set_replica_of("node3", Some("node2"));
        let repointed = refresher.query_node(&seed).await.unwrap();
        assert!(is_changed(&partitions, &repointed));

        // Promoted to a primary without slots.
        cluster.set_replica_of("node3", None);
        let promoted = refresher.query_node(&seed).await.unwrap();
        assert!(is_changed(&partitions, &promoted));
    }
}
