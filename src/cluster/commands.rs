//! Cluster management commands used for topology discovery and redirects.

use crate::core::command::Cmd;

/// Creates a CLUSTER NODES command.
///
/// The reply is a bulk string with one line per known node: ID, address,
/// flags, primary, ping/pong times, epoch, link state and owned slots.
pub fn cluster_nodes() -> Cmd {
    Cmd::new("CLUSTER").arg("NODES")
}

/// Creates an ASKING command.
///
/// Sent right before a command redirected with `ASK`. The flag only covers
/// the next command on the same connection, so both go out in one pipeline.
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}
