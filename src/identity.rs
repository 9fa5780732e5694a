//! # Identity and Identifier Algebra
//!
//! This module defines the identifier types the rest of the stack routes on:
//!
//! - [`Keypair`]: Ed25519 signing keypair; the private half of a peer's identity
//! - [`Digest`]: 20-byte (160-bit) SHA-1 hash of a public key, the routable identifier
//! - [`Namespace`]: 4-byte tag separating the global peer graph from group graphs
//! - [`NodeId`]: namespace + digest, the address every packet is routed by
//!
//! ## Identity model
//!
//! A peer's identity is the SHA-1 digest of its Ed25519 public key. Possession
//! of the private key proves the identity during the session handshake, and the
//! digest doubles as the peer's position in the XOR metric space, so identities
//! can be used directly for Kademlia-style routing.
//!
//! ## Wire encoding
//!
//! A `NodeId` serializes as a single byte string: the 4-byte namespace followed
//! by the digest in big-endian with leading zero bytes stripped. Decoding
//! right-aligns a short digest back into 160 bits. The display form is base58
//! over the same minimal byte form.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest as _, Sha1};

/// Width of a [`Digest`] in bytes.
pub const DIGEST_LEN: usize = 20;

/// Width of a [`Digest`] in bits; also the number of routing-table buckets.
pub const DIGEST_BITS: usize = DIGEST_LEN * 8;

/// Namespace of the global peer graph (direct peer-to-peer traffic).
pub const GLOBAL_NAMESPACE: Namespace = Namespace([1, 1, 1, 1]);

/// Namespace of group identifiers; selects a per-group DHT.
pub const GROUP_NAMESPACE: Namespace = Namespace([2, 2, 2, 2]);

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 signing keypair backing a peer identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS random source.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The peer's routable identifier: SHA-1 of the public key.
    pub fn digest(&self) -> Digest {
        Digest::of_public_key(&self.public_key_bytes())
    }

    /// The peer's id in the global namespace.
    pub fn node_id(&self) -> NodeId {
        NodeId::new(GLOBAL_NAMESPACE, self.digest())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("digest", &self.digest().to_string())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Digest
// ============================================================================

/// A 160-bit big-endian identifier in the XOR metric space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    #[inline]
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// SHA-1 of an Ed25519 public key.
    pub fn of_public_key(public_key: &[u8; 32]) -> Self {
        Self(Sha1::digest(public_key).into())
    }

    /// SHA-1 of an arbitrary key string, used for DHT value addressing.
    pub fn of_key(key: &str) -> Self {
        Self(Sha1::digest(key.as_bytes()).into())
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; DIGEST_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    #[inline]
    pub fn xor(&self, other: &Digest) -> Digest {
        let mut out = [0u8; DIGEST_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Digest(out)
    }

    /// Bit `i` counted from the most significant bit.
    #[inline]
    pub fn bit(&self, i: usize) -> u8 {
        (self.0[i / 8] >> (7 - i % 8)) & 1
    }

    /// Routing-table bucket index for a distance value:
    /// `floor(log2(x + 1)) - 1`, clamped to zero.
    ///
    /// Distances 0..=2 collapse into bucket 0 and only distances at or above
    /// `2^159` reach the two highest buckets, matching the convention the
    /// routing table is built around.
    pub fn bucket_index(&self) -> usize {
        // x + 1 with carry; overflow means x was 2^160 - 1.
        let mut bytes = self.0;
        let mut carry = true;
        for b in bytes.iter_mut().rev() {
            if !carry {
                break;
            }
            let (v, c) = b.overflowing_add(1);
            *b = v;
            carry = c;
        }
        if carry {
            return DIGEST_BITS - 1;
        }
        for (i, b) in bytes.iter().enumerate() {
            if *b != 0 {
                let msb_offset = i * 8 + b.leading_zeros() as usize;
                let log2 = DIGEST_BITS - 1 - msb_offset;
                return log2.saturating_sub(1);
            }
        }
        0
    }

    /// Big-endian bytes with leading zeros stripped; empty for zero.
    pub fn minimal_bytes(&self) -> &[u8] {
        let start = self.0.iter().position(|&b| b != 0).unwrap_or(DIGEST_LEN);
        &self.0[start..]
    }

    /// Rebuild a digest from minimal big-endian bytes, right-aligned.
    pub fn from_minimal_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > DIGEST_LEN {
            return None;
        }
        let mut out = [0u8; DIGEST_LEN];
        out[DIGEST_LEN - bytes.len()..].copy_from_slice(bytes);
        Some(Self(out))
    }
}

impl Ord for Digest {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Digest {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.minimal_bytes()).into_string())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        Digest::from_minimal_bytes(&bytes)
            .ok_or_else(|| anyhow::anyhow!("digest longer than 160 bits"))
    }
}

// ============================================================================
// Namespace and NodeId
// ============================================================================

/// 4-byte tag selecting which DHT resolves an identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Namespace(pub [u8; 4]);

impl Namespace {
    #[inline]
    pub fn is_global(&self) -> bool {
        *self == GLOBAL_NAMESPACE
    }
}

/// A namespaced 160-bit identifier: a peer in the global namespace, or a
/// group in the group namespace.
///
/// Equality covers both fields; distance and ordering are over the digest
/// only, with the namespace carried along from the left operand.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub ns: Namespace,
    pub digest: Digest,
}

impl NodeId {
    #[inline]
    pub fn new(ns: Namespace, digest: Digest) -> Self {
        Self { ns, digest }
    }

    /// A peer id in the global namespace.
    #[inline]
    pub fn global(digest: Digest) -> Self {
        Self::new(GLOBAL_NAMESPACE, digest)
    }

    /// A group id in the group namespace.
    #[inline]
    pub fn group(digest: Digest) -> Self {
        Self::new(GROUP_NAMESPACE, digest)
    }

    pub fn random(ns: Namespace) -> Self {
        Self::new(ns, Digest::random())
    }

    #[inline]
    pub fn xor(&self, other: &NodeId) -> Digest {
        self.digest.xor(&other.digest)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.digest, f)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let minimal = self.digest.minimal_bytes();
        let mut bytes = Vec::with_capacity(4 + minimal.len());
        bytes.extend_from_slice(&self.ns.0);
        bytes.extend_from_slice(minimal);
        serializer.serialize_bytes(&bytes)
    }
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte string of 4 namespace bytes followed by up to 20 digest bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
        if v.len() < 4 {
            return Err(E::invalid_length(v.len(), &self));
        }
        let ns = Namespace([v[0], v[1], v[2], v[3]]);
        let digest = Digest::from_minimal_bytes(&v[4..])
            .ok_or_else(|| E::invalid_length(v.len(), &self))?;
        Ok(NodeId::new(ns, digest))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<NodeId, E> {
        self.visit_bytes(&v)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
        let mut bytes = Vec::with_capacity(4 + DIGEST_LEN);
        while let Some(b) = seq.next_element::<u8>()? {
            bytes.push(b);
        }
        self.visit_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(NodeIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_from_u64(v: u64) -> Digest {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes[DIGEST_LEN - 8..].copy_from_slice(&v.to_be_bytes());
        Digest(bytes)
    }

    #[test]
    fn xor_is_commutative_and_self_inverse() {
        for _ in 0..50 {
            let a = Digest::random();
            let b = Digest::random();
            assert_eq!(a.xor(&b), b.xor(&a));
            assert!(a.xor(&a).is_zero());
            assert_eq!(a.xor(&b).xor(&b), a);
        }
    }

    #[test]
    fn bucket_index_small_values() {
        assert_eq!(digest_from_u64(0).bucket_index(), 0);
        assert_eq!(digest_from_u64(1).bucket_index(), 0);
        assert_eq!(digest_from_u64(2).bucket_index(), 0);
        assert_eq!(digest_from_u64(3).bucket_index(), 1);
        assert_eq!(digest_from_u64(7).bucket_index(), 2);
        assert_eq!(digest_from_u64(255).bucket_index(), 7);
        assert_eq!(digest_from_u64(256).bucket_index(), 7);
        assert_eq!(digest_from_u64(511).bucket_index(), 8);
    }

    #[test]
    fn bucket_index_extremes() {
        let mut top = [0u8; DIGEST_LEN];
        top[0] = 0x80;
        assert_eq!(Digest(top).bucket_index(), 158);

        let all_ones = Digest([0xff; DIGEST_LEN]);
        assert_eq!(all_ones.bucket_index(), 159);
    }

    #[test]
    fn bit_indexing_from_msb() {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes[0] = 0b1000_0001;
        let d = Digest(bytes);
        assert_eq!(d.bit(0), 1);
        assert_eq!(d.bit(1), 0);
        assert_eq!(d.bit(7), 1);
        assert_eq!(d.bit(8), 0);
    }

    #[test]
    fn base58_round_trip() {
        for _ in 0..50 {
            let d = Digest::random();
            let s = d.to_string();
            assert_eq!(s.parse::<Digest>().unwrap(), d);
        }
    }

    #[test]
    fn base58_round_trip_with_leading_zeros() {
        let d = digest_from_u64(42);
        assert_eq!(d.to_string().parse::<Digest>().unwrap(), d);
    }

    #[test]
    fn node_id_msgpack_round_trip() {
        for _ in 0..50 {
            let id = NodeId::random(GLOBAL_NAMESPACE);
            let bytes = rmp_serde::to_vec_named(&id).unwrap();
            let back: NodeId = rmp_serde::from_slice(&bytes).unwrap();
            assert_eq!(back, id);
        }
    }

    #[test]
    fn node_id_msgpack_round_trip_short_digest() {
        let id = NodeId::group(digest_from_u64(7));
        let bytes = rmp_serde::to_vec_named(&id).unwrap();
        let back: NodeId = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, id);
        assert_eq!(back.ns, GROUP_NAMESPACE);
    }

    #[test]
    fn keypair_digest_is_sha1_of_public_key() {
        let keypair = Keypair::generate();
        let expected = Digest(Sha1::digest(keypair.public_key_bytes()).into());
        assert_eq!(keypair.digest(), expected);
        assert_eq!(keypair.node_id().ns, GLOBAL_NAMESPACE);
    }

    #[test]
    fn keypair_secret_round_trip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(restored.digest(), keypair.digest());
    }

    #[test]
    fn ordering_matches_unsigned_integer_order() {
        assert!(digest_from_u64(1) < digest_from_u64(2));
        assert!(digest_from_u64(0xffff) < Digest([0xff; DIGEST_LEN]));
    }
}
