//! # Slotwise
//!
//! Cluster-aware client core for a key-value store sharded over 16384 hash
//! slots. The client discovers the topology from seed nodes, routes every
//! command to the node owning its slot, follows `MOVED`/`ASK` redirects with
//! a bounded execution count and keeps its view current in the background.
//!
//! ## Features
//!
//! - `json` - serialize options and partition snapshots with `serde`
//! - `test-utils` - in-memory cluster simulator ([`testing`])
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use slotwise::ClusterClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClusterClient::builder()
//!         .seeds("127.0.0.1:7000,127.0.0.1:7001")
//!         .periodic_refresh(true)
//!         .refresh_interval(Duration::from_secs(10))
//!         .build()
//!         .await?;
//!
//!     client.set("greeting", "hello").await?;
//!     println!("{} nodes", client.partitions().len());
//!     client.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod core;
pub mod proto;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use crate::cluster::{
    key_slot, ClusterClient, ClusterClientBuilder, ClusterOptions, ClusterView, NodeDescriptor,
    NodeFlags, NodeId, Partitions, Redirect, Routed, SchedulerState,
};
pub use crate::core::command::Cmd;
pub use crate::core::connection::TcpConnector;
pub use crate::core::{Connection, Connector, Endpoint, Error, Result};
pub use crate::proto::frame::Frame;
