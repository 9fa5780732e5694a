//! # Tangor - Decentralized Messaging Substrate
//!
//! Tangor is a peer-to-peer messaging stack with no central directory:
//!
//! - **Identity**: peers are identified by the SHA-1 digest of their Ed25519
//!   public key, a 160-bit id that doubles as their routing address
//! - **Discovery**: a Kademlia-style DHT over raw UDP datagrams
//! - **Sessions**: authenticated, ordered packet streams over QUIC, sharing
//!   the DHT's UDP socket
//! - **Groups**: an independent DHT per joined group, with TTL-bounded
//!   broadcast forwarding between members
//! - **Typed messages**: named serde schemas with request/response
//!   correlation above the packet layer
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, digests, namespaced node ids |
//! | `table` | Kademlia buckets and neighbor queries |
//! | `dht` | RPC state machine, iterative lookups, key-value mirror |
//! | `transport` | Shared-socket UDP demultiplexer and QUIC endpoint |
//! | `crypto` | Certificate generation and digest-pinning TLS verifiers |
//! | `session` | Framed authenticated packet streams |
//! | `router` | Session table, send queue, group forwarding plane |
//! | `node` | Typed-message registry and handler dispatch |
//! | `config` | Port ranges and bootstrap expansion |
//! | `client` | Messaging facade with the standard schemas |
//!
//! ## Quick Start
//!
//! ```ignore
//! let keypair = Keypair::generate();
//! let client = Client::bind(&keypair, Config::default()).await?;
//! client.handle_messages(|src, msg| println!("{src}: {}", msg.body));
//! client.run().await;
//! ```

pub mod client;
pub mod config;
mod crypto;
pub mod dht;
pub mod identity;
pub mod messages;
pub mod node;
pub mod router;
pub mod session;
pub mod table;
pub mod transport;

pub use client::{ChatMessage, Client, UserProfile, UserStatus};
pub use config::{BootstrapEntry, Config, PortRange};
pub use identity::{Digest, Keypair, Namespace, NodeId, GLOBAL_NAMESPACE, GROUP_NAMESPACE};
pub use node::{Inbound, Node, Reply};
pub use router::{Message, Router};
pub use table::NodeInfo;
