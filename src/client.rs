//! Instant-messaging facade over the typed node.
//!
//! Registers the standard application message types, installs a default
//! handler (chat acks, profile answers, presence echoes), and keeps the
//! roster. Applications that want different semantics can skip this and
//! drive [`Node`](crate::node::Node) directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::identity::{Digest, Keypair, NodeId};
use crate::node::{Inbound, Node, Reply};
use crate::table::NodeInfo;

// ============================================================================
// Standard message schemas
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub body: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageAck {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusKind {
    Online,
    Away,
    Offline,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserStatus {
    pub kind: StatusKind,
    #[serde(default)]
    pub message: String,
}

impl Default for UserStatus {
    fn default() -> Self {
        Self {
            kind: StatusKind::Offline,
            message: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub nickname: String,
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfileRequest {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProfileResponse {
    pub profile: UserProfile,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub status: UserStatus,
    pub ack: bool,
}

// ============================================================================
// Roster
// ============================================================================

/// The set of peers this client notifies about presence changes.
#[derive(Default)]
pub struct Roster {
    list: Mutex<Vec<NodeId>>,
}

impl Roster {
    pub fn add(&self, id: NodeId) {
        let mut list = self.list.lock().unwrap();
        if !list.contains(&id) {
            list.push(id);
        }
    }

    pub fn remove(&self, id: &NodeId) {
        self.list.lock().unwrap().retain(|n| n != id);
    }

    pub fn list(&self) -> Vec<NodeId> {
        self.list.lock().unwrap().clone()
    }
}

// ============================================================================
// Client
// ============================================================================

type ChatHandler = Arc<dyn Fn(NodeId, ChatMessage) + Send + Sync>;

pub struct Client {
    node: Arc<Node>,
    id: NodeId,
    pub roster: Arc<Roster>,
    status: Arc<Mutex<UserStatus>>,
    profile: Arc<Mutex<UserProfile>>,
    chat_handler: Arc<RwLock<Option<ChatHandler>>>,
}

impl Client {
    /// Bind a node from the keypair and wire up the standard types and the
    /// default handler.
    pub async fn bind(keypair: &Keypair, config: Config) -> Result<Client> {
        let node = Arc::new(Node::bind(keypair, config).await?);

        node.register_message_type::<ChatMessage>("chat");
        node.register_message_type::<MessageAck>("ack");
        node.register_message_type::<UserProfileRequest>("profile-req");
        node.register_message_type::<UserProfileResponse>("profile-res");
        node.register_message_type::<UserPresence>("presence");

        let status = Arc::new(Mutex::new(UserStatus::default()));
        let profile = Arc::new(Mutex::new(UserProfile::default()));
        let chat_handler: Arc<RwLock<Option<ChatHandler>>> = Arc::new(RwLock::new(None));

        {
            let status = status.clone();
            let profile = profile.clone();
            let chat_handler = chat_handler.clone();
            node.handle(move |src, inbound: Inbound| {
                if inbound.is::<ChatMessage>() {
                    let msg = inbound.downcast::<ChatMessage>().ok()?;
                    if let Some(handler) = chat_handler.read().unwrap().clone() {
                        handler(src, msg);
                    }
                    return Reply::new(&MessageAck {}).ok();
                }
                if inbound.is::<UserProfileRequest>() {
                    let profile = profile.lock().unwrap().clone();
                    return Reply::new(&UserProfileResponse { profile }).ok();
                }
                if let Some(presence) = inbound.downcast_ref::<UserPresence>() {
                    if !presence.ack {
                        let status = status.lock().unwrap().clone();
                        return Reply::new(&UserPresence { status, ack: true }).ok();
                    }
                    return None;
                }
                None
            });
        }

        let id = keypair.node_id();
        Ok(Client {
            node,
            id,
            roster: Arc::new(Roster::default()),
            status,
            profile,
            chat_handler,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Run the node's dispatch loop in the current task until closed.
    pub async fn run(&self) {
        self.node.run().await;
    }

    pub async fn send_message(&self, dst: NodeId, msg: ChatMessage) -> Result<()> {
        self.node.send(dst, &msg).await
    }

    /// Register the chat callback invoked for every inbound chat message.
    pub fn handle_messages(&self, handler: impl Fn(NodeId, ChatMessage) + Send + Sync + 'static) {
        *self.chat_handler.write().unwrap() = Some(Arc::new(handler));
    }

    pub async fn request_profile(&self, dst: NodeId) -> Result<UserProfileResponse> {
        self.node.request(dst, &UserProfileRequest {}).await
    }

    pub fn set_profile(&self, profile: UserProfile) {
        *self.profile.lock().unwrap() = profile;
    }

    pub fn set_status(&self, status: UserStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn join(&self, group: Digest) -> Result<()> {
        self.node.join(NodeId::group(group))
    }

    pub fn leave(&self, group: Digest) -> Result<()> {
        self.node.leave(NodeId::group(group))
    }

    /// Serialize the known-node set for reuse on the next start.
    pub fn marshal_cache(&self) -> Result<Vec<u8>> {
        crate::messages::encode(&self.node.known_nodes())
    }

    /// Reseed the routing tables from a previous run's cache.
    pub fn unmarshal_cache(&self, data: &[u8]) -> Result<()> {
        let nodes: Vec<NodeInfo> = crate::messages::decode_bounded(data)?;
        for node in nodes {
            self.node.add_node(node);
        }
        Ok(())
    }

    /// Announce offline presence to the roster, then shut the node down.
    pub async fn close(&self) {
        let status = UserStatus {
            kind: StatusKind::Offline,
            message: String::new(),
        };
        for peer in self.roster.list() {
            if let Err(e) = self
                .node
                .send(peer, &UserPresence { status: status.clone(), ack: false })
                .await
            {
                debug!(peer = %peer, error = %e, "offline presence not sent");
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.node.close();
    }
}
