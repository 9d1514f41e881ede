//! # Cluster routing
//!
//! Slot-based routing over a sharded cluster of 16384 hash slots.
//!
//! ## Layers
//!
//! - [`slot`] - key to slot hashing with `{...}` hash tags
//! - [`topology`] / [`partitions`] - node descriptors and the immutable
//!   slot table snapshot
//! - [`refresh`] - concurrent `CLUSTER NODES` queries against seeds
//! - [`pool`] - one shared connection per node address
//! - [`router`] - slot resolution plus `MOVED`/`ASK` handling with a bounded
//!   execution count
//! - [`scheduler`] - the background refresh loop
//! - [`client`] - the [`ClusterClient`] facade
//!
//! ## Example
//!
//! ```no_run
//! # async fn example() -> slotwise::Result<()> {
//! use slotwise::{ClusterClient, Cmd};
//!
//! let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
//! let routed = client.route(Cmd::new("GET").key("user:{42}")).await?;
//! println!("{:?} after {} execution(s)", routed.reply, routed.executions);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod commands;
pub mod options;
pub mod partitions;
pub mod pool;
pub mod redirect;
pub mod refresh;
pub mod router;
pub mod scheduler;
pub mod slot;
pub mod topology;

#[cfg(test)]
mod tests;

pub use client::ClusterClient;
pub use options::{ClusterClientBuilder, ClusterOptions};
pub use partitions::{PartitionTable, Partitions};
pub use pool::ConnectionPool;
pub use redirect::Redirect;
pub use refresh::TopologyRefresher;
pub use router::{Routed, RoutedCommand, Router};
pub use scheduler::{RefreshScheduler, SchedulerState};
pub use slot::{command_slot, key_slot, SLOT_COUNT};
pub use topology::{parse_cluster_nodes, ClusterView, NodeDescriptor, NodeFlags, NodeId};
