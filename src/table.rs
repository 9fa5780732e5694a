//! # Kademlia Routing Table
//!
//! 160 buckets of [`NodeInfo`] records, indexed by the bit length of the XOR
//! distance between the table's origin and the peer. The origin is the owning
//! node's digest for the main DHT and the group digest for group DHTs, so a
//! group table clusters members around the group identifier.
//!
//! Replacement policy: a bucket holds up to `k` entries in observed order; on
//! overflow the newest observation overwrites the tail slot. Stale peers age
//! out by being overwritten rather than by liveness probing.

use std::net::SocketAddr;
use std::sync::RwLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::identity::{Digest, NodeId, DIGEST_BITS};

/// Bucket replication factor.
pub const DEFAULT_K: usize = 10;

/// An observed peer: who it is and where it was last seen.
///
/// Only the DHT creates these, from datagrams it has actually received;
/// application code reads them but never forges them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

#[derive(Serialize, Deserialize)]
struct NodeInfoWire {
    id: NodeId,
    addr: String,
}

impl Serialize for NodeInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        NodeInfoWire {
            id: self.id,
            addr: self.addr.to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = NodeInfoWire::deserialize(deserializer)?;
        let addr = wire
            .addr
            .parse()
            .map_err(|_| serde::de::Error::custom("invalid socket address"))?;
        Ok(NodeInfo { id: wire.id, addr })
    }
}

/// The bucket array. All operations lock the whole table briefly; the lock is
/// never held across I/O.
pub struct NodeTable {
    buckets: RwLock<Vec<Vec<NodeInfo>>>,
    origin: Digest,
    k: usize,
}

impl NodeTable {
    pub fn new(k: usize, origin: Digest) -> Self {
        Self {
            buckets: RwLock::new(vec![Vec::new(); DIGEST_BITS]),
            origin,
            k,
        }
    }

    fn bucket_of(&self, digest: &Digest) -> usize {
        digest.xor(&self.origin).bucket_index()
    }

    /// Record an observation. An existing entry for the same id is replaced
    /// wherever it sat in the bucket; a full bucket loses its tail entry.
    pub fn insert(&self, node: NodeInfo) {
        self.remove(&node.id);

        let b = self.bucket_of(&node.id.digest);
        let mut buckets = self.buckets.write().unwrap();
        let bucket = &mut buckets[b];
        if bucket.len() < self.k {
            bucket.push(node);
        } else {
            *bucket.last_mut().unwrap() = node;
        }
    }

    pub fn remove(&self, id: &NodeId) {
        let b = self.bucket_of(&id.digest);
        let mut buckets = self.buckets.write().unwrap();
        buckets[b].retain(|n| n.id.digest != id.digest);
    }

    /// Look up a peer in its home bucket.
    pub fn find(&self, id: &NodeId) -> Option<NodeInfo> {
        let b = self.bucket_of(&id.digest);
        let buckets = self.buckets.read().unwrap();
        buckets[b].iter().find(|n| n.id.digest == id.digest).copied()
    }

    /// Every known peer, in bucket order.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let buckets = self.buckets.read().unwrap();
        buckets.iter().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        let buckets = self.buckets.read().unwrap();
        buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `k` peers near a target: the target's home bucket first, then
    /// neighboring buckets walked outward symmetrically until enough entries
    /// have accumulated. Returns the tail of the accumulation, which favors
    /// the buckets closest to the target.
    pub fn nearest_nodes(&self, target: &NodeId) -> Vec<NodeInfo> {
        let b = self.bucket_of(&target.digest);
        let buckets = self.buckets.read().unwrap();

        let mut acc: Vec<NodeInfo> = buckets[b].clone();
        if acc.len() >= self.k {
            return acc.split_off(acc.len() - self.k);
        }
        for i in 1..DIGEST_BITS {
            let above = b + i;
            if above < DIGEST_BITS {
                acc.extend_from_slice(&buckets[above]);
            }
            if i <= b {
                acc.extend_from_slice(&buckets[b - i]);
            }
            if acc.len() >= self.k {
                return acc.split_off(acc.len() - self.k);
            }
            if above >= DIGEST_BITS && i > b {
                break;
            }
        }
        acc
    }

    /// A maintenance set biased toward distant peers: every entry from the
    /// low buckets until `k` are collected, then one entry per remaining
    /// non-empty bucket for global coverage.
    pub fn finger_nodes(&self) -> Vec<NodeInfo> {
        let buckets = self.buckets.read().unwrap();
        let mut nodes = Vec::new();
        let mut i = 0;
        'fill: while i < DIGEST_BITS {
            for n in &buckets[i] {
                nodes.push(*n);
                if nodes.len() >= self.k {
                    i += 1;
                    break 'fill;
                }
            }
            i += 1;
        }
        while i < DIGEST_BITS {
            if let Some(n) = buckets[i].first() {
                nodes.push(*n);
            }
            i += 1;
        }
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{NodeId, DIGEST_LEN, GLOBAL_NAMESPACE};

    fn id_from_u64(v: u64) -> NodeId {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes[DIGEST_LEN - 8..].copy_from_slice(&v.to_be_bytes());
        NodeId::new(GLOBAL_NAMESPACE, Digest(bytes))
    }

    fn info(id: NodeId) -> NodeInfo {
        NodeInfo::new(id, "127.0.0.1:9200".parse().unwrap())
    }

    #[test]
    fn insert_find_remove() {
        let table = NodeTable::new(50, Digest::default());
        let ids: Vec<NodeId> = (1..=100).map(id_from_u64).collect();

        for id in &ids {
            table.insert(info(*id));
        }
        for id in &ids {
            let found = table.find(id).expect("inserted node must be findable");
            assert_eq!(found.id, *id);
        }
        for id in &ids {
            table.remove(id);
            assert!(table.find(id).is_none());
        }
        assert!(table.is_empty());
    }

    #[test]
    fn entries_land_in_their_distance_bucket() {
        let origin = Digest::random();
        let table = NodeTable::new(DEFAULT_K, origin);
        for _ in 0..200 {
            table.insert(info(NodeId::global(Digest::random())));
        }
        for n in table.nodes() {
            let expected = n.id.digest.xor(&origin).bucket_index();
            let probe = NodeTable::new(DEFAULT_K, origin);
            probe.insert(n);
            let buckets = probe.buckets.read().unwrap();
            assert_eq!(buckets[expected].len(), 1);
        }
    }

    #[test]
    fn buckets_never_exceed_k() {
        let table = NodeTable::new(3, Digest::default());
        // Ids 7..=10 share bucket 2 relative to a zero origin.
        for v in 7..=10 {
            table.insert(info(id_from_u64(v)));
        }
        assert_eq!(table.len(), 3);
        // The overflow observation replaced the tail.
        assert!(table.find(&id_from_u64(10)).is_some());
        assert!(table.find(&id_from_u64(9)).is_none());
    }

    #[test]
    fn reinsert_updates_address() {
        let table = NodeTable::new(DEFAULT_K, Digest::default());
        let id = id_from_u64(9);
        table.insert(info(id));
        let moved = NodeInfo::new(id, "127.0.0.1:9999".parse().unwrap());
        table.insert(moved);
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(&id).unwrap().addr, moved.addr);
    }

    #[test]
    fn nearest_nodes_prefers_close_buckets() {
        let origin = Digest::default();
        let table = NodeTable::new(4, origin);
        for v in 1..=64 {
            table.insert(info(id_from_u64(v)));
        }
        let target = id_from_u64(3);
        let nearest = table.nearest_nodes(&target);
        assert!(nearest.len() <= 4);
        let max_dist = nearest
            .iter()
            .map(|n| n.id.xor(&target))
            .max()
            .unwrap();
        // Every returned peer is closer than some excluded far peer.
        let far = id_from_u64(64);
        assert!(max_dist < far.xor(&target));
    }

    #[test]
    fn nearest_nodes_walks_outward_when_sparse() {
        let table = NodeTable::new(DEFAULT_K, Digest::default());
        for v in [1u64, 2, 300, 70_000] {
            table.insert(info(id_from_u64(v)));
        }
        let nearest = table.nearest_nodes(&id_from_u64(1));
        assert_eq!(nearest.len(), 4);
    }

    #[test]
    fn finger_nodes_cover_far_buckets() {
        let table = NodeTable::new(2, Digest::default());
        // Two low-bucket peers, then one peer per distant power of two.
        for v in [1u64, 2, 1 << 20, 1 << 40, 1 << 60] {
            table.insert(info(id_from_u64(v)));
        }
        let fingers = table.finger_nodes();
        // k entries from the low buckets plus one for each non-empty far bucket.
        assert_eq!(fingers.len(), 5);
    }

    #[test]
    fn table_never_returns_duplicates() {
        let table = NodeTable::new(DEFAULT_K, Digest::default());
        let id = id_from_u64(5);
        table.insert(info(id));
        table.insert(info(id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn node_info_wire_round_trip() {
        let original = info(id_from_u64(77));
        let bytes = rmp_serde::to_vec_named(&original).unwrap();
        let back: NodeInfo = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, original);
    }
}
