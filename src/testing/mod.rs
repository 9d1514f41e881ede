//! In-memory cluster simulator.
//!
//! [`MockCluster`] models a set of nodes with slot ownership, gossip
//! membership, slot migration and per-node key space. Its [`Connector`]
//! hands out connections that answer like cluster nodes do: `MOVED` for
//! slots owned elsewhere, `ASK` for keys already migrated, `CLUSTER NODES`
//! listing the nodes the answering node knows.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};

use crate::cluster::slot::key_slot;
use crate::core::command::Cmd;
use crate::core::{Connection, Connector, Endpoint, Error, Result};
use crate::proto::frame::Frame;

const HOST: &str = "127.0.0.1";

#[derive(Debug, Default)]
struct MockNode {
    port: u16,
    slots: BTreeSet<u16>,
    known: BTreeSet<String>,
    migrating: HashMap<u16, String>,
    importing: HashMap<u16, String>,
    data: HashMap<Bytes, Bytes>,
    primary: Option<String>,
    extra_flags: Vec<String>,
    reply_delay: Option<Duration>,
    hide_host: bool,
    unreachable: bool,
    unresponsive: bool,
    log: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, MockNode>,
    password: Option<String>,
    connects: usize,
    connections: Vec<Arc<ConnectionFlags>>,
}

impl State {
    fn node_by_address(&self, address: &str) -> Option<(&String, &MockNode)> {
        self.nodes
            .iter()
            .find(|(_, n)| format!("{}:{}", HOST, n.port) == address)
    }

    fn owner_of(&self, slot: u16) -> Option<&MockNode> {
        self.nodes.values().find(|n| n.slots.contains(&slot))
    }

    fn cluster_nodes(&self, me: &str) -> String {
        let Some(node) = self.nodes.get(me) else {
            return String::new();
        };
        let mut out = String::new();
        for id in &node.known {
            let Some(other) = self.nodes.get(id) else {
                continue;
            };
            let host = if other.hide_host { "" } else { HOST };
            let mut flags = Vec::new();
            if id == me {
                flags.push("myself");
            }
            flags.push(if other.primary.is_some() { "slave" } else { "master" });
            flags.extend(other.extra_flags.iter().map(String::as_str));
            let _ = write!(
                out,
                "{} {}:{}@{} {} {} 0 0 0 connected",
                id,
                host,
                other.port,
                u32::from(other.port) + 10000,
                flags.join(","),
                other.primary.as_deref().unwrap_or("-")
            );
            for (start, end) in ranges(&other.slots) {
                if start == end {
                    let _ = write!(out, " {}", start);
                } else {
                    let _ = write!(out, " {}-{}", start, end);
                }
            }
            if id == me {
                for (slot, target) in &other.migrating {
                    let _ = write!(out, " [{}->-{}]", slot, target);
                }
            }
            out.push('\n');
        }
        out
    }

    fn execute(&mut self, me: &str, conn: &ConnectionFlags, cmd: &Cmd) -> Frame {
        let args: Vec<String> = cmd
            .args()
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        if let Some(node) = self.nodes.get_mut(me) {
            node.log.push(args.join(" "));
        }
        let name = args[0].to_ascii_uppercase();

        if name == "AUTH" {
            let given = args.last().cloned().unwrap_or_default();
            return match &self.password {
                Some(expected) if *expected == given => {
                    conn.authenticated.store(true, Ordering::SeqCst);
                    Frame::simple("OK")
                }
                Some(_) => Frame::error("WRONGPASS invalid username-password pair"),
                None => Frame::error("ERR AUTH <password> called without any password configured"),
            };
        }
        if self.password.is_some() && !conn.authenticated.load(Ordering::SeqCst) {
            return Frame::error("NOAUTH Authentication required.");
        }

        let asking = conn.asking.swap(false, Ordering::SeqCst);
        match name.as_str() {
            "PING" => return Frame::simple("PONG"),
            "ASKING" => {
                conn.asking.store(true, Ordering::SeqCst);
                return Frame::simple("OK");
            }
            "CLUSTER" if args.get(1).map(|s| s.to_ascii_uppercase()).as_deref() == Some("NODES") => {
                return Frame::bulk(self.cluster_nodes(me));
            }
            _ => {}
        }

        let Some(key) = cmd.args().get(1).cloned() else {
            return Frame::error(format!("ERR unknown command '{}'", args[0]));
        };
        let slot = key_slot(&key);
        let Some(node) = self.nodes.get(me) else {
            return Frame::error("ERR node is gone");
        };

        if node.slots.contains(&slot) {
            if let Some(target) = node.migrating.get(&slot) {
                if !node.data.contains_key(&key) {
                    if let Some(target) = self.nodes.get(target) {
                        return Frame::error(format!("ASK {} {}:{}", slot, HOST, target.port));
                    }
                }
            }
        } else if !(asking && node.importing.contains_key(&slot)) {
            return match self.owner_of(slot) {
                Some(owner) => Frame::error(format!("MOVED {} {}:{}", slot, HOST, owner.port)),
                None => Frame::error("CLUSTERDOWN Hash slot not served"),
            };
        }

        let Some(node) = self.nodes.get_mut(me) else {
            return Frame::error("ERR node is gone");
        };
        match name.as_str() {
            "GET" => Frame::BulkString(node.data.get(&key).cloned()),
            "SET" => match cmd.args().get(2) {
                Some(value) => {
                    node.data.insert(key, value.clone());
                    Frame::simple("OK")
                }
                None => Frame::error("ERR wrong number of arguments for 'set' command"),
            },
            "DEL" => Frame::Integer(i64::from(node.data.remove(&key).is_some())),
            "EXISTS" => Frame::Integer(i64::from(node.data.contains_key(&key))),
            _ => Frame::error(format!("ERR unknown command '{}'", args[0])),
        }
    }
}

fn ranges(slots: &BTreeSet<u16>) -> Vec<(u16, u16)> {
    let mut out: Vec<(u16, u16)> = Vec::new();
    for &slot in slots {
        match out.last_mut() {
            Some((_, end)) if *end + 1 == slot => *end = slot,
            _ => out.push((slot, slot)),
        }
    }
    out
}

/// A simulated cluster. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<State>>,
}

impl MockCluster {
    /// Creates an empty cluster without a password.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cluster whose nodes require `password`.
    pub fn with_password(password: &str) -> Self {
        let cluster = Self::new();
        cluster.state().password = Some(password.to_string());
        cluster
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_node<R>(&self, id: &str, f: impl FnOnce(&mut MockNode) -> R) -> Option<R> {
        self.state().nodes.get_mut(id).map(f)
    }

    /// Starts a node on `127.0.0.1:port` that only knows itself.
    pub fn add_node(&self, id: &str, port: u16) -> Endpoint {
        let mut node = MockNode {
            port,
            ..MockNode::default()
        };
        node.known.insert(id.to_string());
        self.state().nodes.insert(id.to_string(), node);
        Endpoint::new(HOST, port)
    }

    /// Joins the clusters of `a` and `b`; every node of either side learns
    /// every node of the other.
    pub fn meet(&self, a: &str, b: &str) {
        let mut state = self.state();
        let mut group = BTreeSet::new();
        for id in [a, b] {
            if let Some(node) = state.nodes.get(id) {
                group.extend(node.known.iter().cloned());
            }
        }
        for id in &group {
            if let Some(node) = state.nodes.get_mut(id) {
                node.known = group.clone();
            }
        }
    }

    /// Assigns `slots` to `id`.
    pub fn add_slots(&self, id: &str, slots: impl IntoIterator<Item = u16>) {
        self.with_node(id, |n| n.slots.extend(slots));
    }

    /// Removes `slots` from `id`.
    pub fn del_slots(&self, id: &str, slots: impl IntoIterator<Item = u16>) {
        self.with_node(id, |n| {
            for slot in slots {
                n.slots.remove(&slot);
            }
        });
    }

    /// Marks `slot` as migrating from `from` to `to`.
    pub fn set_migrating(&self, slot: u16, from: &str, to: &str) {
        self.with_node(from, |n| n.migrating.insert(slot, to.to_string()));
        self.with_node(to, |n| n.importing.insert(slot, from.to_string()));
    }

    /// Finishes a slot move: `to` owns `slot`, its keys move along and any
    /// migration marks are cleared.
    pub fn move_slot(&self, slot: u16, from: &str, to: &str) {
        let mut state = self.state();
        let mut moved = Vec::new();
        if let Some(node) = state.nodes.get_mut(from) {
            node.slots.remove(&slot);
            node.migrating.remove(&slot);
            let keys: Vec<Bytes> = node
                .data
                .keys()
                .filter(|k| key_slot(k) == slot)
                .cloned()
                .collect();
            for key in keys {
                if let Some(value) = node.data.remove(&key) {
                    moved.push((key, value));
                }
            }
        }
        if let Some(node) = state.nodes.get_mut(to) {
            node.slots.insert(slot);
            node.importing.remove(&slot);
            node.data.extend(moved);
        }
    }

    /// Removes `id` from the cluster; every other node forgets it.
    pub fn forget(&self, id: &str) {
        let mut state = self.state();
        state.nodes.remove(id);
        for node in state.nodes.values_mut() {
            node.known.remove(id);
        }
    }

    /// Turns `id` into a replica of `primary`, or back into a primary with
    /// `None`.
    pub fn set_replica_of(&self, id: &str, primary: Option<&str>) {
        self.with_node(id, |n| n.primary = primary.map(str::to_string));
    }

    /// Sets the extra flags `id` is reported with, e.g. `["fail?"]`.
    pub fn set_flags(&self, id: &str, flags: &[&str]) {
        self.with_node(id, |n| n.extra_flags = flags.iter().map(|f| f.to_string()).collect());
    }

    /// Holds back the replies to the next command batch `id` receives for
    /// `delay`. The replies reflect the state at the time the batch arrived.
    pub fn delay_next_reply(&self, id: &str, delay: Duration) {
        self.with_node(id, |n| n.reply_delay = Some(delay));
    }

    /// Makes `id` refuse new connections and fail existing ones.
    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        self.with_node(id, |n| n.unreachable = unreachable);
    }

    /// Makes connection attempts to `id` hang forever.
    pub fn set_unresponsive(&self, id: &str, unresponsive: bool) {
        self.with_node(id, |n| n.unresponsive = unresponsive);
    }

    /// Makes `id` report an empty host for itself, like a node that never met
    /// another one.
    pub fn hide_host(&self, id: &str) {
        self.with_node(id, |n| n.hide_host = true);
    }

    /// Stores `key` directly on `id`.
    pub fn insert(&self, id: &str, key: &str, value: &str) {
        self.with_node(id, |n| {
            n.data
                .insert(Bytes::copy_from_slice(key.as_bytes()), Bytes::copy_from_slice(value.as_bytes()))
        });
    }

    /// Commands `id` has received, rendered as space-joined arguments.
    pub fn log(&self, id: &str) -> Vec<String> {
        self.with_node(id, |n| n.log.clone()).unwrap_or_default()
    }

    /// Total connection attempts that succeeded.
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    /// Connections handed out and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }

    /// A connector that opens connections to this cluster.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            cluster: self.clone(),
            attempts: AtomicUsize::new(0),
        })
    }
}

/// [`Connector`] for a [`MockCluster`].
#[derive(Debug)]
pub struct MockConnector {
    cluster: MockCluster,
    attempts: AtomicUsize,
}

impl MockConnector {
    /// Connection attempts made through this connector, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<Arc<dyn Connection>>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let address = endpoint.address();
        let mut state = self.cluster.state();

        let node = state
            .node_by_address(&address)
            .map(|(id, n)| (id.clone(), n.unreachable, n.unresponsive));
        match node {
            None | Some((_, true, _)) => {
                let err = Error::Io {
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, address),
                };
                future::ready(Err(err)).boxed()
            }
            Some((_, _, true)) => future::pending::<Result<Arc<dyn Connection>>>().boxed(),
            Some((node_id, _, _)) => {
                let flags = Arc::new(ConnectionFlags::default());
                state.connects += 1;
                state.connections.push(Arc::clone(&flags));
                let connection = MockConnection {
                    cluster: self.cluster.clone(),
                    node_id,
                    flags,
                };
                future::ready(Ok(Arc::new(connection) as Arc<dyn Connection>)).boxed()
            }
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionFlags {
    closed: AtomicBool,
    authenticated: AtomicBool,
    asking: AtomicBool,
}

/// A connection to one simulated node.
#[derive(Debug, Clone)]
pub struct MockConnection {
    cluster: MockCluster,
    node_id: String,
    flags: Arc<ConnectionFlags>,
}

impl Connection for MockConnection {
    fn pipeline(&self, cmds: Vec<Cmd>) -> BoxFuture<'static, Result<Vec<Frame>>> {
        let this = self.clone();
        async move {
            if this.flags.closed.load(Ordering::SeqCst) {
                return Err(Error::closed());
            }
            let (replies, delay) = {
                let mut state = this.cluster.state();
                let delay = match state.nodes.get_mut(&this.node_id) {
                    Some(node) if !node.unreachable => node.reply_delay.take(),
                    _ => return Err(Error::closed()),
                };
                let replies: Vec<Frame> = cmds
                    .iter()
                    .map(|cmd| state.execute(&this.node_id, &this.flags, cmd))
                    .collect();
                (replies, delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(replies)
        }
        .boxed()
    }

    fn close(&self) {
        self.flags.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }
}
