//! # Wire Protocol Messages
//!
//! Serializable types for the three wire protocols, all msgpack-encoded as
//! named maps:
//!
//! | Protocol | Type | Carried over |
//! |----------|------|--------------|
//! | DHT RPC | [`RpcCommand`] | raw UDP datagrams |
//! | Session | [`Packet`] | length-prefixed QUIC stream frames |
//! | Application | [`Envelope`] | `Packet` payloads of kind `msg` |
//!
//! Decoding is bounded: frames above [`MAX_FRAME_SIZE`] are rejected before
//! deserialization so a hostile peer cannot make a node allocate unbounded
//! buffers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::identity::NodeId;
use crate::table::NodeInfo;

/// Largest accepted session frame or datagram payload.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Initial hop budget for originated packets.
pub const INITIAL_TTL: u8 = 3;

/// Width of an RPC correlation id in bytes.
pub const RPC_ID_LEN: usize = 20;

pub const METHOD_PING: &str = "ping";
pub const METHOD_FIND_NODE: &str = "find-node";
pub const METHOD_FIND_VALUE: &str = "find-value";
pub const METHOD_STORE: &str = "store";

/// Packet kind carrying an application envelope.
pub const KIND_MSG: &str = "msg";

/// Packet kind used as a session liveness probe.
pub const KIND_PING: &str = "ping";

/// Encode any wire type as a named msgpack map.
pub fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decode with the frame-size bound enforced first.
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    if bytes.len() > MAX_FRAME_SIZE {
        anyhow::bail!("frame of {} bytes exceeds limit {}", bytes.len(), MAX_FRAME_SIZE);
    }
    Ok(rmp_serde::from_slice(bytes)?)
}

// ============================================================================
// DHT RPC
// ============================================================================

/// A DHT RPC frame. An empty `method` marks a response correlated by `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcCommand {
    pub id: ByteBuf,
    pub method: String,
    pub args: RpcArgs,
}

/// Arguments and response fields, encoded with absent keys omitted.
///
/// `from` names the sender on every frame so receivers get the routing-table
/// observation for free; `group` tags frames belonging to a group DHT with
/// that DHT's root so only members claim them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RpcArgs {
    /// Lookup target of `find-node`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
    /// Key of `find-value` / `store`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Value of `store`, or a found value in a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Closest known peers in a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<NodeId>,
}

impl RpcCommand {
    /// A fresh request with a random 160-bit correlation id.
    pub fn request(method: &str, args: RpcArgs) -> Self {
        let mut id = vec![0u8; RPC_ID_LEN];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut id);
        Self {
            id: ByteBuf::from(id),
            method: method.to_string(),
            args,
        }
    }

    /// A response echoing the request's correlation id.
    pub fn response(id: ByteBuf, args: RpcArgs) -> Self {
        Self {
            id,
            method: String::new(),
            args,
        }
    }

    pub fn is_response(&self) -> bool {
        self.method.is_empty()
    }

    /// Correlation key used by the pending-RPC map.
    pub fn correlation_key(&self) -> String {
        hex::encode(&self.id)
    }
}

// ============================================================================
// Session packets
// ============================================================================

/// A routed packet on a session stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "Dst")]
    pub dst: NodeId,
    #[serde(rename = "Src")]
    pub src: NodeId,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Payload")]
    pub payload: ByteBuf,
    #[serde(rename = "TTL")]
    pub ttl: u8,
}

impl Packet {
    /// An originated packet. The source carries the destination's namespace
    /// so group replies route back through the same plane.
    pub fn new(dst: NodeId, src_digest: crate::identity::Digest, kind: &str, payload: Vec<u8>) -> Self {
        Self {
            dst,
            src: NodeId::new(dst.ns, src_digest),
            kind: kind.to_string(),
            payload: ByteBuf::from(payload),
            ttl: INITIAL_TTL,
        }
    }
}

// ============================================================================
// Application envelopes
// ============================================================================

/// The typed-message wrapper. `content` stays dynamic here; the node layer
/// resolves it against the registry in a second decode pass keyed on `kind`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: rmpv::Value,
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Digest, NodeId, GLOBAL_NAMESPACE};
    use crate::table::NodeInfo;

    #[test]
    fn rpc_command_round_trip() {
        let node = NodeInfo::new(
            NodeId::random(GLOBAL_NAMESPACE),
            "127.0.0.1:9201".parse().unwrap(),
        );
        let cmd = RpcCommand::request(
            METHOD_FIND_NODE,
            RpcArgs {
                id: Some(NodeId::random(GLOBAL_NAMESPACE)),
                from: Some(NodeId::random(GLOBAL_NAMESPACE)),
                nodes: Some(vec![node]),
                ..Default::default()
            },
        );
        let bytes = encode(&cmd).unwrap();
        let back: RpcCommand = decode_bounded(&bytes).unwrap();
        assert_eq!(back.id, cmd.id);
        assert_eq!(back.method, cmd.method);
        assert_eq!(back.args.id, cmd.args.id);
        assert_eq!(back.args.from, cmd.args.from);
        assert_eq!(back.args.nodes, cmd.args.nodes);
        assert!(back.args.key.is_none());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RpcCommand::request(METHOD_PING, RpcArgs::default());
        let b = RpcCommand::request(METHOD_PING, RpcArgs::default());
        assert_eq!(a.id.len(), RPC_ID_LEN);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn response_correlates_by_id() {
        let req = RpcCommand::request(METHOD_PING, RpcArgs::default());
        let res = RpcCommand::response(req.id.clone(), RpcArgs::default());
        assert!(res.is_response());
        assert_eq!(res.correlation_key(), req.correlation_key());
    }

    #[test]
    fn absent_args_are_omitted_from_the_wire() {
        let empty = encode(&RpcArgs::default()).unwrap();
        let full = encode(&RpcArgs {
            key: Some("alpha".into()),
            value: Some("bravo".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(empty.len() < full.len());
    }

    #[test]
    fn packet_round_trip() {
        let src = Digest::random();
        let pkt = Packet::new(
            NodeId::random(GLOBAL_NAMESPACE),
            src,
            KIND_MSG,
            b"hello".to_vec(),
        );
        let bytes = encode(&pkt).unwrap();
        let back: Packet = decode_bounded(&bytes).unwrap();
        assert_eq!(back.dst, pkt.dst);
        assert_eq!(back.src.digest, src);
        assert_eq!(back.kind, KIND_MSG);
        assert_eq!(back.payload.as_ref(), b"hello");
        assert_eq!(back.ttl, INITIAL_TTL);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let bytes = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(decode_bounded::<Packet>(&bytes).is_err());
    }

    #[test]
    fn envelope_two_pass_decode() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Profile {
            nickname: String,
        }

        let envelope = Envelope {
            kind: "profile-res".into(),
            content: rmpv::ext::to_value(Profile {
                nickname: "ada".into(),
            })
            .unwrap(),
            id: "c0ffee".into(),
        };
        let bytes = encode(&envelope).unwrap();

        let outer: Envelope = decode_bounded(&bytes).unwrap();
        assert_eq!(outer.kind, "profile-res");
        assert_eq!(outer.id, "c0ffee");
        let inner: Profile = rmpv::ext::from_value(outer.content).unwrap();
        assert_eq!(inner.nickname, "ada");
    }
}
