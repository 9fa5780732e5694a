//! # Typed Messaging Layer
//!
//! The node sits above the router's raw byte channel and gives applications
//! typed messages:
//!
//! - a registry binding short wire names to serde types, both directions,
//! - an envelope codec (`{type, content, id}`) with a two-pass decode:
//!   the outer envelope first, then the registered type from the dynamic
//!   `content` value,
//! - a single application handler whose return value becomes the reply,
//!   correlated by the envelope id,
//! - an awaitable request/response API over the same correlation ids.
//!
//! Unknown message types are an error on send and a logged drop on receive.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::config::Config;
use crate::identity::{Keypair, NodeId};
use crate::messages::{self, Envelope};
use crate::router::{Message, Router};
use crate::table::NodeInfo;

/// How long [`Node::request`] waits for its correlated reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A decoded inbound message of some registered type.
pub struct Inbound {
    kind: String,
    value: Box<dyn Any + Send>,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound").field("kind", &self.kind).finish()
    }
}

impl Inbound {
    /// The wire name this message was registered under.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast<T: 'static>(self) -> Result<T, Inbound> {
        match self.value.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(value) => Err(Inbound {
                kind: self.kind,
                value,
            }),
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

/// A handler's outgoing reply, carrying its dynamic content until the
/// registry resolves the wire name from the type.
pub struct Reply {
    type_id: TypeId,
    value: rmpv::Value,
}

impl Reply {
    pub fn new<T: Serialize + 'static>(msg: &T) -> Result<Reply> {
        Ok(Reply {
            type_id: TypeId::of::<T>(),
            value: rmpv::ext::to_value(msg)?,
        })
    }
}

/// The application callback: called once per inbound message, the returned
/// reply (if any) is sent back correlated to the incoming envelope.
pub type Handler = Arc<dyn Fn(NodeId, Inbound) -> Option<Reply> + Send + Sync>;

type DecodeFn = Box<dyn Fn(rmpv::Value) -> Result<Inbound> + Send + Sync>;

#[derive(Default)]
struct Registry {
    decoders: HashMap<String, DecodeFn>,
    names: HashMap<TypeId, String>,
}

impl Registry {
    fn register<T>(&mut self, name: &str)
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.names.insert(TypeId::of::<T>(), name.to_string());
        let kind = name.to_string();
        self.decoders.insert(
            name.to_string(),
            Box::new(move |value| {
                let decoded: T = rmpv::ext::from_value(value)
                    .map_err(|e| anyhow::anyhow!("content does not match schema: {e}"))?;
                Ok(Inbound {
                    kind: kind.clone(),
                    value: Box::new(decoded),
                })
            }),
        );
    }

    fn name_of(&self, type_id: &TypeId) -> Option<&str> {
        self.names.get(type_id).map(String::as_str)
    }

    fn decode(&self, kind: &str, content: rmpv::Value) -> Option<Result<Inbound>> {
        self.decoders.get(kind).map(|decode| decode(content))
    }
}

pub struct Node {
    router: Router,
    registry: RwLock<Registry>,
    handler: RwLock<Option<Handler>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Inbound>>>,
}

impl Node {
    pub async fn bind(keypair: &Keypair, config: Config) -> Result<Node> {
        let router = Router::bind(keypair, config).await?;
        Ok(Node {
            router,
            registry: RwLock::new(Registry::default()),
            handler: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.router.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.router.local_addr()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Bind a wire name to a message schema. Registering the same pair again
    /// is a no-op; registering a new type under an old name rebinds it.
    pub fn register_message_type<T>(&self, name: &str)
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.registry.write().unwrap().register::<T>(name);
    }

    /// Install the single application handler.
    pub fn handle(&self, handler: impl Fn(NodeId, Inbound) -> Option<Reply> + Send + Sync + 'static) {
        *self.handler.write().unwrap() = Some(Arc::new(handler));
    }

    /// Send a typed message with no correlation id.
    pub async fn send<T: Serialize + 'static>(&self, dst: NodeId, msg: &T) -> Result<()> {
        self.send_with_id(dst, msg, "").await
    }

    /// Send a typed message and await the correlated typed reply.
    pub async fn request<T, R>(&self, dst: NodeId, msg: &T) -> Result<R>
    where
        T: Serialize + 'static,
        R: 'static,
    {
        let correlation = {
            let mut token = [0u8; 8];
            rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut token);
            hex::encode(token)
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(correlation.clone(), tx);

        if let Err(e) = self.send_with_id(dst, msg, &correlation).await {
            self.pending.lock().unwrap().remove(&correlation);
            return Err(e);
        }

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(inbound)) => inbound
                .downcast::<R>()
                .map_err(|got| anyhow::anyhow!("reply of unexpected type {}", got.kind())),
            _ => {
                self.pending.lock().unwrap().remove(&correlation);
                anyhow::bail!("request to {dst} timed out")
            }
        }
    }

    async fn send_with_id<T: Serialize + 'static>(
        &self,
        dst: NodeId,
        msg: &T,
        id: &str,
    ) -> Result<()> {
        let envelope = {
            let registry = self.registry.read().unwrap();
            let kind = registry
                .name_of(&TypeId::of::<T>())
                .context("unknown message type")?
                .to_string();
            Envelope {
                kind,
                content: rmpv::ext::to_value(msg)?,
                id: id.to_string(),
            }
        };
        let bytes = messages::encode(&envelope)?;
        self.router.send_message(dst, bytes).await
    }

    /// Discover bootstrap peers, then dispatch inbound messages until the
    /// router closes.
    pub async fn run(&self) {
        self.router.discover_bootstrap();
        loop {
            let message = match self.router.recv_message().await {
                Ok(message) => message,
                Err(_) => break,
            };
            self.dispatch(message).await;
        }
        debug!("node loop exited");
    }

    async fn dispatch(&self, message: Message) {
        let envelope: Envelope = match messages::decode_bounded(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(src = %message.node, error = %e, "dropping undecodable envelope");
                return;
            }
        };

        let inbound = {
            let registry = self.registry.read().unwrap();
            match registry.decode(&envelope.kind, envelope.content) {
                Some(Ok(inbound)) => inbound,
                Some(Err(e)) => {
                    debug!(src = %message.node, kind = %envelope.kind, error = %e, "dropping malformed message");
                    return;
                }
                None => {
                    warn!(src = %message.node, kind = %envelope.kind, "unknown message type");
                    return;
                }
            }
        };

        // A non-empty id matching one of our outstanding requests is the
        // reply to it; anything else is a fresh inbound message.
        if !envelope.id.is_empty() {
            let slot = self.pending.lock().unwrap().remove(&envelope.id);
            if let Some(tx) = slot {
                let _ = tx.send(inbound);
                return;
            }
        }

        let handler = self.handler.read().unwrap().clone();
        let Some(handler) = handler else {
            return;
        };
        if let Some(reply) = handler(message.node, inbound) {
            if let Err(e) = self.send_reply(message.node, reply, &envelope.id).await {
                debug!(dst = %message.node, error = %e, "failed to send reply");
            }
        }
    }

    async fn send_reply(&self, dst: NodeId, reply: Reply, id: &str) -> Result<()> {
        // Replies go straight to the originating peer even when the request
        // arrived through a group broadcast.
        let dst = NodeId::global(dst.digest);
        let envelope = {
            let registry = self.registry.read().unwrap();
            let kind = registry
                .name_of(&reply.type_id)
                .context("reply type is not registered")?
                .to_string();
            Envelope {
                kind,
                content: reply.value,
                id: id.to_string(),
            }
        };
        let bytes = messages::encode(&envelope)?;
        self.router.send_message(dst, bytes).await
    }

    // Router passthroughs used by the client facade.

    pub fn join(&self, group: NodeId) -> Result<()> {
        self.router.join(group)
    }

    pub fn leave(&self, group: NodeId) -> Result<()> {
        self.router.leave(group)
    }

    pub fn add_node(&self, info: NodeInfo) {
        self.router.add_node(info)
    }

    pub fn known_nodes(&self) -> Vec<NodeInfo> {
        self.router.known_nodes()
    }

    pub fn close(&self) {
        self.router.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Greeting {
        text: String,
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Farewell {
        text: String,
    }

    #[test]
    fn registry_maps_both_directions() {
        let mut registry = Registry::default();
        registry.register::<Greeting>("greeting");

        assert_eq!(registry.name_of(&TypeId::of::<Greeting>()), Some("greeting"));
        let value = rmpv::ext::to_value(Greeting {
            text: "hi".into(),
        })
        .unwrap();
        let inbound = registry.decode("greeting", value).unwrap().unwrap();
        assert_eq!(inbound.kind(), "greeting");
        let decoded = inbound.downcast::<Greeting>().unwrap();
        assert_eq!(decoded.text, "hi");
    }

    #[test]
    fn double_registration_is_idempotent() {
        let mut registry = Registry::default();
        registry.register::<Greeting>("greeting");
        registry.register::<Greeting>("greeting");

        assert_eq!(registry.names.len(), 1);
        assert_eq!(registry.decoders.len(), 1);
        assert_eq!(registry.name_of(&TypeId::of::<Greeting>()), Some("greeting"));
    }

    #[test]
    fn unknown_kind_decodes_to_none() {
        let registry = Registry::default();
        assert!(registry.decode("mystery", rmpv::Value::Nil).is_none());
    }

    #[test]
    fn wrong_schema_is_an_error_not_a_panic() {
        let mut registry = Registry::default();
        registry.register::<Greeting>("greeting");
        let result = registry
            .decode("greeting", rmpv::Value::from(17))
            .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn downcast_to_wrong_type_returns_the_message() {
        let mut registry = Registry::default();
        registry.register::<Greeting>("greeting");
        let value = rmpv::ext::to_value(Greeting {
            text: "hi".into(),
        })
        .unwrap();
        let inbound = registry.decode("greeting", value).unwrap().unwrap();
        let back = inbound.downcast::<Farewell>().unwrap_err();
        assert!(back.is::<Greeting>());
    }

    #[test]
    fn reply_resolves_through_registry() {
        let mut registry = Registry::default();
        registry.register::<Farewell>("farewell");
        let reply = Reply::new(&Farewell {
            text: "bye".into(),
        })
        .unwrap();
        assert_eq!(registry.name_of(&reply.type_id), Some("farewell"));
    }
}
