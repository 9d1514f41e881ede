//! Cluster node descriptors and the `CLUSTER NODES` parser.

use std::fmt;

use crate::core::{Endpoint, Error, Result};

use super::slot::SLOT_COUNT;

/// Unique identifier for a node in the cluster.
///
/// Node IDs are 40-character hex strings assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new NodeId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the node ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role and state flags of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeFlags {
    /// The node that produced the view.
    pub myself: bool,
    /// Node serves slots as a primary.
    pub primary: bool,
    /// Node replicates a primary.
    pub replica: bool,
    /// Node is possibly failing (`fail?`).
    pub pfail: bool,
    /// Node failure is confirmed.
    pub fail: bool,
    /// Node is still in the handshake phase.
    pub handshake: bool,
    /// Node address is unknown.
    pub noaddr: bool,
}

impl NodeFlags {
    /// Parses node flags from a comma-separated string.
    ///
    /// Unknown flags are ignored.
    ///
    /// ```
    /// # use slotwise::NodeFlags;
    /// let flags = NodeFlags::parse("master,myself");
    /// assert!(flags.primary);
    /// assert!(flags.myself);
    /// assert!(!flags.replica);
    /// ```
    pub fn parse(flags_str: &str) -> Self {
        let mut flags = Self::default();
        for flag in flags_str.split(',') {
            match flag.trim() {
                "master" => flags.primary = true,
                "slave" | "replica" => flags.replica = true,
                "myself" => flags.myself = true,
                "fail?" | "pfail" => flags.pfail = true,
                "fail" => flags.fail = true,
                "handshake" => flags.handshake = true,
                "noaddr" => flags.noaddr = true,
                _ => {}
            }
        }
        flags
    }

    /// True if the node is failing or not yet usable.
    pub fn is_failing(&self) -> bool {
        self.fail || self.pfail || self.handshake || self.noaddr
    }

    /// The flags that describe the cluster, without `myself`.
    ///
    /// `myself` only says which node answered the query.
    pub(crate) fn without_myself(self) -> Self {
        Self {
            myself: false,
            ..self
        }
    }
}

/// One node of a cluster view.
///
/// Descriptors are immutable once published in a
/// [`Partitions`](super::partitions::Partitions) snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeDescriptor {
    /// Node ID.
    pub id: NodeId,
    /// Where to reach the node, with the credential to use.
    pub endpoint: Endpoint,
    /// Role flags.
    pub flags: NodeFlags,
    /// The primary this node replicates, for replicas.
    pub replica_of: Option<NodeId>,
    /// Configuration epoch.
    pub config_epoch: u64,
    /// Whether the cluster bus link is up.
    pub connected: bool,
    /// Owned slots, ascending.
    pub slots: Vec<u16>,
}

impl NodeDescriptor {
    /// Creates a primary descriptor owning `slots`.
    pub fn new(id: impl Into<NodeId>, endpoint: Endpoint, slots: impl IntoIterator<Item = u16>) -> Self {
        let mut slots: Vec<u16> = slots.into_iter().filter(|&s| s < SLOT_COUNT).collect();
        slots.sort_unstable();
        slots.dedup();
        Self {
            id: id.into(),
            endpoint,
            flags: NodeFlags {
                primary: true,
                ..NodeFlags::default()
            },
            replica_of: None,
            config_epoch: 0,
            connected: true,
            slots,
        }
    }

    /// True if this node serves slots as a primary.
    pub fn is_primary(&self) -> bool {
        self.flags.primary
    }

    /// True if this node replicates another node.
    pub fn is_replica(&self) -> bool {
        self.flags.replica
    }

    /// True if the node owns `slot`.
    pub fn has_slot(&self, slot: u16) -> bool {
        self.slots.binary_search(&slot).is_ok()
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One node's reported belief of the cluster topology.
///
/// Transient: produced by a topology query, consumed by reconciliation.
#[derive(Debug, Clone)]
pub struct ClusterView {
    /// The seed that answered.
    pub viewed_by: Endpoint,
    /// The nodes as reported, in reply order.
    pub nodes: Vec<NodeDescriptor>,
}

impl ClusterView {
    /// Builds a view from a `CLUSTER NODES` reply received from `viewed_by`.
    ///
    /// Nodes that report an empty host inherit the seed's host, and every
    /// node inherits the seed's credential.
    pub fn from_cluster_nodes(viewed_by: Endpoint, text: &str) -> Result<Self> {
        let mut nodes = parse_cluster_nodes(text)?;
        for node in &mut nodes {
            if node.endpoint.host().is_empty() {
                node.endpoint = node.endpoint.clone().with_host(viewed_by.host());
            }
            node.endpoint = node.endpoint.clone().with_credentials(
                viewed_by.username().map(str::to_string),
                viewed_by.password().map(str::to_string),
            );
        }
        Ok(Self { viewed_by, nodes })
    }
}

/// Parses a `CLUSTER NODES` reply.
///
/// Each line reads
/// `<id> <ip:port@cport[,hostname]> <flags> <primary|-> <ping> <pong> <epoch> <link> <slot>...`.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for lines with too few fields or bad numbers.
pub fn parse_cluster_nodes(text: &str) -> Result<Vec<NodeDescriptor>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_node_line)
        .collect()
}

fn parse_node_line(line: &str) -> Result<NodeDescriptor> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(malformed(line, "expected at least 8 fields"));
    }

    let endpoint = parse_node_address(fields[1]).ok_or_else(|| malformed(line, "bad address"))?;
    let replica_of = match fields[3] {
        "-" => None,
        id => Some(NodeId::new(id)),
    };
    let config_epoch = fields[6]
        .parse()
        .map_err(|_| malformed(line, "bad config epoch"))?;

    let mut slots = Vec::new();
    for token in &fields[8..] {
        // Migration markers such as `[42->-id]` describe transient state.
        if token.starts_with('[') {
            continue;
        }
        let (start, end) = match token.split_once('-') {
            Some((a, b)) => (parse_slot(a), parse_slot(b)),
            None => (parse_slot(token), parse_slot(token)),
        };
        match (start, end) {
            (Some(start), Some(end)) if start <= end => slots.extend(start..=end),
            _ => return Err(malformed(line, "bad slot range")),
        }
    }
    slots.sort_unstable();
    slots.dedup();

    Ok(NodeDescriptor {
        id: NodeId::new(fields[0]),
        endpoint,
        flags: NodeFlags::parse(fields[2]),
        replica_of,
        config_epoch,
        connected: fields[7] == "connected",
        slots,
    })
}

/// Parses `ip:port@cport[,hostname]`; the host may be empty.
fn parse_node_address(field: &str) -> Option<Endpoint> {
    let addr = field.split(['@', ',']).next()?;
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some(Endpoint::new(host, port.parse().ok()?))
}

fn parse_slot(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|&slot| slot < SLOT_COUNT)
}

fn malformed(line: &str, why: &str) -> Error {
    Error::Protocol {
        message: format!("malformed CLUSTER NODES line ({}): {}", why, line),
    }
}
