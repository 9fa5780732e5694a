//! # Kademlia-style Distributed Hash Table
//!
//! One `Dht` instance per namespace: the main instance rooted at the local
//! node's own id, plus one per joined group rooted at the group id. Each
//! instance owns a routing table, a small key-value mirror, and a pending-RPC
//! map, and speaks the four-method RPC over raw UDP datagrams on the shared
//! transport socket.
//!
//! ## RPC state machine
//!
//! | Method | Request args | Response args |
//! |--------|--------------|---------------|
//! | `ping` | | |
//! | `find-node` | `id` | `nodes` |
//! | `find-value` | `key` | `value` or `nodes` |
//! | `store` | `key`, `value` | none sent |
//!
//! An empty method marks a response, correlated through the pending map by
//! the hex of the 160-bit random command id. Every frame carries `from` (the
//! sender's id, inserted into the table as a free observation) and, for group
//! instances, `group` (the root id, so only members of that group claim the
//! frame).
//!
//! ## Iterative lookups
//!
//! `find_nearest_node` runs the classical recursion-free lookup: seed the
//! frontier from the local table, query every unqueried frontier peer in
//! parallel, feed discovered peers back in, stop when nothing is outstanding.
//! `load_value` is the same walk except that the first response carrying a
//! value wins outright and node responses only re-feed peers strictly closer
//! to the key than the responder.
//!
//! Outgoing RPCs time out after [`RPC_TIMEOUT`] and drain their pending entry
//! so the map cannot leak on packet loss.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde_bytes::ByteBuf;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::identity::{Digest, NodeId};
use crate::messages::{
    RpcArgs, RpcCommand, METHOD_FIND_NODE, METHOD_FIND_VALUE, METHOD_PING, METHOD_STORE,
};
use crate::table::{NodeInfo, NodeTable};
use crate::transport::SplitSock;

/// How long an outgoing RPC waits for its response.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot delivery slots for outstanding RPCs, keyed by hex command id.
/// Entries are inserted before the request is sent and drained by whichever
/// comes first, the response or the timeout.
struct PendingRpcs {
    slots: Mutex<HashMap<String, oneshot::Sender<RpcCommand>>>,
}

impl PendingRpcs {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn push(&self, key: String, tx: oneshot::Sender<RpcCommand>) {
        self.slots.lock().unwrap().insert(key, tx);
    }

    fn pop(&self, key: &str) -> Option<oneshot::Sender<RpcCommand>> {
        self.slots.lock().unwrap().remove(key)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

pub struct Dht {
    k: usize,
    /// This node's own id, used as `from` on every outgoing frame.
    self_id: NodeId,
    /// Root of the metric space: self for the main instance, the group id
    /// for group instances.
    root: NodeId,
    table: NodeTable,
    kvs: Mutex<HashMap<String, String>>,
    pending: PendingRpcs,
    sock: Arc<SplitSock>,
}

impl Dht {
    pub fn new(k: usize, self_id: NodeId, root: NodeId, sock: Arc<SplitSock>) -> Arc<Self> {
        Arc::new(Self {
            k,
            self_id,
            root,
            table: NodeTable::new(k, root.digest),
            kvs: Mutex::new(HashMap::new()),
            pending: PendingRpcs::new(),
            sock,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The group tag carried on this instance's frames; `None` for the main
    /// instance.
    fn group_tag(&self) -> Option<NodeId> {
        (!self.root.ns.is_global()).then_some(self.root)
    }

    fn base_args(&self) -> RpcArgs {
        RpcArgs {
            from: Some(self.self_id),
            group: self.group_tag(),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Table access
    // ------------------------------------------------------------------

    pub fn get_node_info(&self, id: &NodeId) -> Option<NodeInfo> {
        self.table.find(id)
    }

    pub fn known_nodes(&self) -> Vec<NodeInfo> {
        self.table.nodes()
    }

    fn observe(&self, info: NodeInfo) {
        if info.id.digest == self.self_id.digest {
            return;
        }
        self.table.insert(info);
    }

    /// Seed the table with a peer learned out of band and probe it.
    pub fn add_node(self: &Arc<Self>, info: NodeInfo) {
        self.observe(info);
        let dht = self.clone();
        tokio::spawn(async move {
            let cmd = RpcCommand::request(METHOD_PING, dht.base_args());
            if dht.call(info.addr, cmd).await.is_some() {
                trace!(peer = %info.id, "seeded peer answered ping");
            }
        });
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Handle one raw datagram. The router feeds every datagram to every
    /// instance; frames tagged for a different namespace are dropped here.
    pub async fn process_packet(&self, payload: &[u8], src: SocketAddr) {
        let mut command: RpcCommand = match crate::messages::decode_bounded(payload) {
            Ok(c) => c,
            Err(e) => {
                debug!(src = %src, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        if command.args.group != self.group_tag() {
            return;
        }
        if let Some(from) = command.args.from {
            self.observe(NodeInfo::new(from, src));
        }

        // Detached so the response arm can move the command into its slot.
        let method = std::mem::take(&mut command.method);
        match method.as_str() {
            METHOD_PING => {
                trace!(src = %src, "dht ping");
                self.respond(src, command.id, RpcArgs::default()).await;
            }
            METHOD_FIND_NODE => {
                let Some(target) = command.args.id else {
                    return;
                };
                trace!(src = %src, target = %target, "dht find-node");
                let nodes = self.table.nearest_nodes(&target);
                self.respond(
                    src,
                    command.id,
                    RpcArgs {
                        nodes: Some(nodes),
                        ..Default::default()
                    },
                )
                .await;
            }
            METHOD_FIND_VALUE => {
                let Some(key) = command.args.key else {
                    return;
                };
                trace!(src = %src, key = %key, "dht find-value");
                let local = self.kvs.lock().unwrap().get(&key).cloned();
                let args = match local {
                    Some(value) => RpcArgs {
                        value: Some(value),
                        ..Default::default()
                    },
                    None => {
                        let key_id = NodeId::new(self.root.ns, Digest::of_key(&key));
                        RpcArgs {
                            nodes: Some(self.table.nearest_nodes(&key_id)),
                            ..Default::default()
                        }
                    }
                };
                self.respond(src, command.id, args).await;
            }
            METHOD_STORE => {
                if let (Some(key), Some(value)) = (command.args.key, command.args.value) {
                    trace!(src = %src, key = %key, "dht store");
                    self.kvs.lock().unwrap().insert(key, value);
                }
            }
            "" => {
                if let Some(tx) = self.pending.pop(&command.correlation_key()) {
                    let _ = tx.send(command);
                }
            }
            other => {
                debug!(src = %src, method = %other, "unknown rpc method");
            }
        }
    }

    async fn respond(&self, dest: SocketAddr, id: ByteBuf, mut args: RpcArgs) {
        args.from = Some(self.self_id);
        args.group = self.group_tag();
        self.send_command(dest, RpcCommand::response(id, args)).await;
    }

    async fn send_command(&self, dest: SocketAddr, command: RpcCommand) {
        match crate::messages::encode(&command) {
            Ok(bytes) => {
                if let Err(e) = self.sock.send_dgram(&bytes, dest).await {
                    debug!(dest = %dest, error = %e, "failed to send dht frame");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode dht frame"),
        }
    }

    // ------------------------------------------------------------------
    // Outgoing RPCs
    // ------------------------------------------------------------------

    /// Send a request and wait for its correlated response. `None` covers
    /// both packet loss and peers that never answer; the pending slot is
    /// drained either way.
    async fn call(&self, dest: SocketAddr, command: RpcCommand) -> Option<RpcCommand> {
        let key = command.correlation_key();
        let (tx, rx) = oneshot::channel();
        self.pending.push(key.clone(), tx);
        self.send_command(dest, command).await;

        match timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(response)) => Some(response),
            _ => {
                self.pending.pop(&key);
                trace!(dest = %dest, "rpc timed out");
                None
            }
        }
    }

    /// Unsolicited discovery probe: ask `addr` for peers near ourselves and
    /// absorb whatever comes back.
    pub async fn discover(&self, addr: SocketAddr) {
        let mut args = self.base_args();
        args.id = Some(self.self_id);
        let command = RpcCommand::request(METHOD_FIND_NODE, args);
        if let Some(response) = self.call(addr, command).await {
            self.absorb_nodes(response.args.nodes.as_deref().unwrap_or_default());
        }
    }

    /// Re-probe the finger set so far buckets stay populated.
    pub async fn refresh(self: &Arc<Self>) {
        let mut join_set = JoinSet::new();
        for node in self.table.finger_nodes() {
            let dht = self.clone();
            join_set.spawn(async move {
                dht.discover(node.addr).await;
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    fn absorb_nodes(&self, nodes: &[NodeInfo]) {
        for node in nodes {
            self.observe(*node);
        }
    }

    // ------------------------------------------------------------------
    // Iterative lookups
    // ------------------------------------------------------------------

    /// Iterative `find-node`: returns the `k` peers closest to `target`
    /// observed during the walk, nearest first.
    pub async fn find_nearest_node(self: &Arc<Self>, target: NodeId) -> Vec<NodeInfo> {
        let mut queried: HashSet<Digest> = HashSet::new();
        let mut observed: Vec<NodeInfo> = Vec::new();
        let mut frontier = self.table.nearest_nodes(&target);
        if frontier.is_empty() {
            return observed;
        }

        let mut join_set = JoinSet::new();
        loop {
            while let Some(node) = frontier.pop() {
                if !queried.insert(node.id.digest) {
                    continue;
                }
                observed.push(node);
                let dht = self.clone();
                join_set.spawn(async move { dht.query_find_node(node, target).await });
            }
            match join_set.join_next().await {
                Some(Ok(Some(nodes))) => {
                    for node in nodes {
                        if node.id.digest != self.self_id.digest
                            && !queried.contains(&node.id.digest)
                        {
                            frontier.push(node);
                        }
                    }
                }
                Some(_) => {}
                None => break,
            }
        }

        observed.sort_by_key(|n| n.id.digest.xor(&target.digest));
        observed.truncate(self.k);
        observed
    }

    async fn query_find_node(&self, node: NodeInfo, target: NodeId) -> Option<Vec<NodeInfo>> {
        let mut args = self.base_args();
        args.id = Some(target);
        let response = self
            .call(node.addr, RpcCommand::request(METHOD_FIND_NODE, args))
            .await?;
        let nodes = response.args.nodes?;
        self.absorb_nodes(&nodes);
        Some(nodes)
    }

    /// Iterative `find-value`. The local mirror short-circuits everything;
    /// after that the first response carrying the value ends the search and
    /// node responses only re-feed peers strictly closer than the responder.
    pub async fn load_value(self: &Arc<Self>, key: &str) -> Option<String> {
        if let Some(value) = self.kvs.lock().unwrap().get(key).cloned() {
            return Some(value);
        }

        let key_digest = Digest::of_key(key);
        let key_id = NodeId::new(self.root.ns, key_digest);
        let mut frontier = self.table.nearest_nodes(&key_id);
        if frontier.is_empty() {
            return None;
        }

        let mut queried: HashSet<Digest> = HashSet::new();
        let mut join_set = JoinSet::new();
        loop {
            while let Some(node) = frontier.pop() {
                if !queried.insert(node.id.digest) {
                    continue;
                }
                let dht = self.clone();
                let key = key.to_string();
                join_set.spawn(async move { dht.query_find_value(node, &key, key_digest).await });
            }
            match join_set.join_next().await {
                Some(Ok(Some(ValueQueryOutcome::Value(value)))) => {
                    // First value wins; outstanding queries are aborted with
                    // the JoinSet.
                    return Some(value);
                }
                Some(Ok(Some(ValueQueryOutcome::Closer(nodes)))) => {
                    for node in nodes {
                        if node.id.digest != self.self_id.digest
                            && !queried.contains(&node.id.digest)
                        {
                            frontier.push(node);
                        }
                    }
                }
                Some(_) => {}
                None => return None,
            }
        }
    }

    async fn query_find_value(
        &self,
        node: NodeInfo,
        key: &str,
        key_digest: Digest,
    ) -> Option<ValueQueryOutcome> {
        let mut args = self.base_args();
        args.key = Some(key.to_string());
        let response = self
            .call(node.addr, RpcCommand::request(METHOD_FIND_VALUE, args))
            .await?;
        if let Some(value) = response.args.value {
            return Some(ValueQueryOutcome::Value(value));
        }
        let nodes = response.args.nodes?;
        self.absorb_nodes(&nodes);
        let responder_distance = node.id.digest.xor(&key_digest);
        let closer = nodes
            .into_iter()
            .filter(|n| n.id.digest.xor(&key_digest) < responder_distance)
            .collect();
        Some(ValueQueryOutcome::Closer(closer))
    }

    /// Replicate a value to the `k` peers closest to `sha1(key)`.
    pub async fn store_value(self: &Arc<Self>, key: &str, value: &str) {
        let key_id = NodeId::new(self.root.ns, Digest::of_key(key));
        let targets = self.find_nearest_node(key_id).await;
        for node in targets {
            let mut args = self.base_args();
            args.key = Some(key.to_string());
            args.value = Some(value.to_string());
            self.send_command(node.addr, RpcCommand::request(METHOD_STORE, args))
                .await;
        }
    }
}

enum ValueQueryOutcome {
    Value(String),
    Closer(Vec<NodeInfo>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::identity::GLOBAL_NAMESPACE;
    use std::sync::atomic::{AtomicU16, Ordering};

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(43100);

    /// A dht pumped by hand: socket wrapped in a client-only endpoint, with a
    /// task draining raw datagrams into `process_packet`.
    async fn spawn_dht(self_id: NodeId) -> (Arc<Dht>, SocketAddr) {
        let start = PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
        let range = PortRange {
            start,
            end: start + 1,
        };
        let (sock, mut dgram_rx) = SplitSock::bind_in_range(&range).await.unwrap();
        let (_endpoint, sock) = sock.into_endpoint(None).unwrap();
        let port = sock.local_addr().port();
        let dht = Dht::new(crate::table::DEFAULT_K, self_id, self_id, sock);
        let pump = dht.clone();
        tokio::spawn(async move {
            let _endpoint = _endpoint;
            while let Some((payload, src)) = dgram_rx.recv().await {
                pump.process_packet(&payload, src).await;
            }
        });
        (dht, format!("127.0.0.1:{port}").parse().unwrap())
    }

    #[tokio::test]
    async fn ping_response_and_free_observation() {
        let a_id = NodeId::random(GLOBAL_NAMESPACE);
        let b_id = NodeId::random(GLOBAL_NAMESPACE);
        let (a, _a_addr) = spawn_dht(a_id).await;
        let (b, b_addr) = spawn_dht(b_id).await;

        let response = a
            .call(b_addr, RpcCommand::request(METHOD_PING, a.base_args()))
            .await
            .expect("ping answered");
        assert!(response.is_response());
        assert_eq!(response.args.from, Some(b_id));

        // B observed A from the request, A observed B from the response.
        assert!(b.get_node_info(&a_id).is_some());
        assert!(a.get_node_info(&b_id).is_some());
        assert_eq!(a.pending.len(), 0);
    }

    #[tokio::test]
    async fn find_node_returns_known_peers() {
        let a_id = NodeId::random(GLOBAL_NAMESPACE);
        let b_id = NodeId::random(GLOBAL_NAMESPACE);
        let (a, _a_addr) = spawn_dht(a_id).await;
        let (b, b_addr) = spawn_dht(b_id).await;

        let c = NodeInfo::new(
            NodeId::random(GLOBAL_NAMESPACE),
            "127.0.0.1:1".parse().unwrap(),
        );
        b.observe(c);

        a.discover(b_addr).await;
        assert!(a.get_node_info(&c.id).is_some(), "learned c through b");
    }

    #[tokio::test]
    async fn group_tagged_frames_are_ignored_by_other_namespaces() {
        let a_id = NodeId::random(GLOBAL_NAMESPACE);
        let b_id = NodeId::random(GLOBAL_NAMESPACE);
        let (a, _a_addr) = spawn_dht(a_id).await;
        let (b, b_addr) = spawn_dht(b_id).await;

        let mut args = a.base_args();
        args.group = Some(NodeId::group(Digest::random()));
        let outcome = a.call(b_addr, RpcCommand::request(METHOD_PING, args)).await;

        assert!(outcome.is_none(), "main instance must not answer group frames");
        assert!(b.get_node_info(&a_id).is_none(), "no observation either");
        drop(b);
    }

    #[tokio::test]
    async fn store_and_find_value_locally() {
        let a_id = NodeId::random(GLOBAL_NAMESPACE);
        let b_id = NodeId::random(GLOBAL_NAMESPACE);
        let (a, _a_addr) = spawn_dht(a_id).await;
        let (_b, b_addr) = spawn_dht(b_id).await;

        let mut args = a.base_args();
        args.key = Some("alpha".into());
        args.value = Some("bravo".into());
        a.send_command(b_addr, RpcCommand::request(METHOD_STORE, args))
            .await;

        // Ask for it back until the store lands.
        let mut fetched = None;
        for _ in 0..50 {
            let mut args = a.base_args();
            args.key = Some("alpha".into());
            if let Some(res) = a
                .call(b_addr, RpcCommand::request(METHOD_FIND_VALUE, args))
                .await
            {
                if res.args.value.is_some() {
                    fetched = res.args.value;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(fetched.as_deref(), Some("bravo"));
    }

    #[tokio::test]
    async fn unanswered_rpc_times_out_and_drains_pending() {
        let a_id = NodeId::random(GLOBAL_NAMESPACE);
        let (a, _a_addr) = spawn_dht(a_id).await;

        // A bound port with nothing draining datagrams behind it.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = silent.local_addr().unwrap();

        let outcome = a.call(dest, RpcCommand::request(METHOD_PING, a.base_args())).await;
        assert!(outcome.is_none());
        assert_eq!(a.pending.len(), 0, "timeout must drain the pending slot");
    }
}
