//! The client's cluster view.
//!
//! A [`Partitions`] value is an immutable snapshot: the node list and the
//! derived slot table are built together and never change afterwards.
//! [`PartitionTable`] publishes snapshots by swapping an `Arc`, so a reader
//! sees either the old snapshot or the new one, never a half-built table.

use std::sync::{Arc, RwLock};

use super::slot::SLOT_COUNT;
use super::topology::{NodeDescriptor, NodeId};

/// An immutable cluster view: nodes plus the slot→node lookup table.
#[derive(Debug, Clone)]
pub struct Partitions {
    nodes: Vec<Arc<NodeDescriptor>>,
    /// Index into `nodes` for every slot.
    slot_owners: Box<[Option<u32>]>,
}

impl Partitions {
    /// Builds a snapshot from `nodes`.
    ///
    /// If two nodes claim the same slot, the later node in the list wins.
    pub fn new(nodes: Vec<NodeDescriptor>) -> Self {
        let mut slot_owners = vec![None; SLOT_COUNT as usize].into_boxed_slice();
        for (index, node) in nodes.iter().enumerate() {
            for &slot in &node.slots {
                if let Some(owner) = slot_owners.get_mut(slot as usize) {
                    *owner = Some(index as u32);
                }
            }
        }
        Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            slot_owners,
        }
    }

    /// An empty view.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Returns the node owning `slot`, if any.
    pub fn lookup(&self, slot: u16) -> Option<&Arc<NodeDescriptor>> {
        let index = (*self.slot_owners.get(slot as usize)?)?;
        self.nodes.get(index as usize)
    }

    /// All nodes in view order.
    pub fn nodes(&self) -> &[Arc<NodeDescriptor>] {
        &self.nodes
    }

    /// Finds a node by ID.
    pub fn node_by_id(&self, id: &NodeId) -> Option<&Arc<NodeDescriptor>> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no node is known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of slots that have an owner.
    pub fn slot_count(&self) -> usize {
        self.slot_owners.iter().filter(|o| o.is_some()).count()
    }

    /// True if every slot has an owner.
    pub fn is_fully_covered(&self) -> bool {
        self.slot_owners.iter().all(Option::is_some)
    }

    /// A node to ask when no owner is known: the first usable node with an
    /// address, else the first node at all.
    pub fn any_node(&self) -> Option<&Arc<NodeDescriptor>> {
        self.nodes
            .iter()
            .find(|n| !n.flags.is_failing() && !n.endpoint.host().is_empty())
            .or_else(|| self.nodes.first())
    }

    /// Serializes the node list as JSON.
    #[cfg(feature = "json")]
    pub fn to_json(&self) -> crate::Result<String> {
        let nodes: Vec<&NodeDescriptor> = self.nodes.iter().map(Arc::as_ref).collect();
        serde_json::to_string(&nodes).map_err(|e| crate::Error::Protocol {
            message: e.to_string(),
        })
    }
}

impl Default for Partitions {
    fn default() -> Self {
        Self::empty()
    }
}

/// Shared holder of the current [`Partitions`] snapshot.
///
/// Reads clone an `Arc` under a read lock that is never held across I/O;
/// [`replace`](PartitionTable::replace) builds the new snapshot before taking
/// the write lock, so the swap itself is a pointer store.
#[derive(Debug, Default)]
pub struct PartitionTable {
    current: RwLock<Arc<Partitions>>,
}

impl PartitionTable {
    /// Creates a table holding an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Partitions> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Returns the node owning `slot` in the current snapshot.
    pub fn lookup(&self, slot: u16) -> Option<Arc<NodeDescriptor>> {
        self.snapshot().lookup(slot).cloned()
    }

    /// Snapshot of all nodes.
    pub fn nodes(&self) -> Vec<Arc<NodeDescriptor>> {
        self.snapshot().nodes().to_vec()
    }

    /// Replaces the whole view with one built from `nodes`.
    pub fn replace(&self, nodes: Vec<NodeDescriptor>) -> Arc<Partitions> {
        let next = Arc::new(Partitions::new(nodes));
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::clone(&next);
        next
    }
}
