//! # Packet Router
//!
//! The router owns the node's whole connectivity picture:
//!
//! - the main DHT (global namespace) plus one DHT per joined group,
//! - the session table, one authenticated stream per peer,
//! - the outbound send queue with route-discovery fallback,
//! - the group forwarding plane with TTL and duplicate suppression.
//!
//! ## Task layout
//!
//! | Task | Role |
//! |------|------|
//! | main loop | serializes the send queue, the 1 s retry tick, shutdown |
//! | accept loop | adopts inbound QUIC connections as sessions |
//! | datagram loop | feeds raw UDP frames to every DHT instance |
//! | session readers | one per live session, deliver and forward packets |
//!
//! ## Delivery semantics
//!
//! A packet for a global destination goes to that peer's single session,
//! dialing through DHT resolution when none exists. A packet for a group
//! fans out to a session per group member. When no session can be found the
//! packet is queued; every retry tick runs `find_nearest_node` for queued
//! destinations on all DHTs and tries again. Transient peer faults degrade
//! into stalled delivery, never into a crashed loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use lru::LruCache;
use quinn::{ClientConfig, Endpoint};
use sha1::{Digest as _, Sha1};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::{client_config, generate_certificate, server_config};
use crate::dht::Dht;
use crate::identity::{Digest, Keypair, NodeId};
use crate::messages::{Packet, KIND_MSG, KIND_PING};
use crate::session::Session;
use crate::table::{NodeInfo, DEFAULT_K};
use crate::transport::{Datagram, SplitSock};

/// Capacity of the send and receive channels. Producers block when full,
/// which is the backpressure story for misbehaving senders.
const CHANNEL_CAPACITY: usize = 100;

/// Cadence of the retry tick: session pings plus queued-packet redelivery.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Finger-set refresh happens every this many retry ticks.
const REFRESH_EVERY_TICKS: u64 = 30;

/// Ceiling for dialing a resolved peer before giving up this attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of the duplicate-forward suppression cache.
const SEEN_FORWARD_CAPACITY: usize = 1024;

/// A delivered application payload.
#[derive(Clone, Debug)]
pub struct Message {
    /// Originating peer (namespace preserved from the packet source).
    pub node: NodeId,
    pub payload: Vec<u8>,
    /// Arrival-time bytes, usable as an opaque local ordering hint.
    pub id: Vec<u8>,
}

pub struct Router {
    shared: Arc<Shared>,
    id: NodeId,
    send_tx: mpsc::Sender<Packet>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

struct Shared {
    self_id: NodeId,
    endpoint: Endpoint,
    client_config: ClientConfig,
    sock: Arc<SplitSock>,
    main_dht: Arc<Dht>,
    group_dhts: RwLock<HashMap<Digest, Arc<Dht>>>,
    sessions: RwLock<HashMap<Digest, Arc<Session>>>,
    /// Taken (set to `None`) on close so the receive channel actually
    /// closes; readers clone the sender out transiently.
    recv_tx: Mutex<Option<mpsc::Sender<Message>>>,
    seen_forwards: Mutex<LruCache<Digest, ()>>,
    bootstrap: Vec<SocketAddr>,
    shutdown: watch::Sender<bool>,
    k: usize,
}

impl Router {
    /// Bind a port from the configured range and bring up all long-lived
    /// tasks. Failure to bind any port is fatal and reported here.
    pub async fn bind(keypair: &Keypair, config: Config) -> Result<Router> {
        let (sock, dgram_rx) = SplitSock::bind_in_range(&config.ports)
            .await
            .context("failed to bind port")?;
        Self::start(keypair, config, sock, dgram_rx)
    }

    fn start(
        keypair: &Keypair,
        config: Config,
        sock: SplitSock,
        dgram_rx: mpsc::Receiver<Datagram>,
    ) -> Result<Router> {
        let (server_certs, server_key) = generate_certificate(keypair)?;
        let (client_certs, client_key) = generate_certificate(keypair)?;
        let server_config = server_config(server_certs, server_key)?;
        let client_config = client_config(client_certs, client_key)?;

        let (endpoint, sock) = sock
            .into_endpoint(Some(server_config))
            .context("failed to create endpoint")?;

        let id = keypair.node_id();
        info!(id = %id, addr = %sock.local_addr(), "router up");

        let main_dht = Dht::new(DEFAULT_K, id, id, sock.clone());
        let (send_tx, send_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (recv_tx, recv_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            self_id: id,
            endpoint,
            client_config,
            sock,
            main_dht,
            group_dhts: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            recv_tx: Mutex::new(Some(recv_tx)),
            seen_forwards: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_FORWARD_CAPACITY).unwrap(),
            )),
            bootstrap: config.bootstrap_addrs(),
            shutdown,
            k: DEFAULT_K,
        });

        tokio::spawn(accept_loop(shared.clone()));
        tokio::spawn(dgram_loop(shared.clone(), dgram_rx));
        tokio::spawn(main_loop(shared.clone(), send_rx));

        Ok(Router {
            shared,
            id,
            send_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.sock.local_addr()
    }

    /// Fire discovery probes at each address from every DHT instance.
    pub fn discover(&self, addrs: &[SocketAddr]) {
        self.shared.discover(addrs);
    }

    /// Run discovery against the configured bootstrap sweep.
    pub fn discover_bootstrap(&self) {
        let addrs = self.shared.bootstrap.clone();
        self.shared.discover(&addrs);
    }

    /// Create the group's DHT and start discovering members.
    pub fn join(&self, group: NodeId) -> Result<()> {
        let dht = {
            let mut groups = self.shared.group_dhts.write().unwrap();
            if groups.contains_key(&group.digest) {
                anyhow::bail!("already joined {group}");
            }
            let dht = Dht::new(self.shared.k, self.id, group, self.shared.sock.clone());
            groups.insert(group.digest, dht.clone());
            dht
        };
        info!(group = %group, "joined group");
        for addr in self.shared.bootstrap.clone() {
            let dht = dht.clone();
            tokio::spawn(async move {
                dht.discover(addr).await;
            });
        }
        Ok(())
    }

    pub fn leave(&self, group: NodeId) -> Result<()> {
        let removed = self
            .shared
            .group_dhts
            .write()
            .unwrap()
            .remove(&group.digest);
        if removed.is_none() {
            anyhow::bail!("not joined {group}");
        }
        info!(group = %group, "left group");
        Ok(())
    }

    /// Enqueue an application payload for `dst`. Blocks only when the send
    /// queue is full.
    pub async fn send_message(&self, dst: NodeId, payload: Vec<u8>) -> Result<()> {
        let packet = Packet::new(dst, self.id.digest, KIND_MSG, payload);
        self.send_tx
            .send(packet)
            .await
            .map_err(|_| anyhow::anyhow!("router closed"))
    }

    /// The next delivered message, or an error once the router has closed.
    pub async fn recv_message(&self) -> Result<Message> {
        let mut rx = self.recv_rx.lock().await;
        rx.recv().await.context("router closed")
    }

    /// Seed every DHT instance with an out-of-band peer.
    pub fn add_node(&self, info: NodeInfo) {
        self.shared.main_dht.add_node(info);
        for dht in self.shared.group_dhts.read().unwrap().values() {
            dht.add_node(info);
        }
    }

    /// All peers known across the main and group DHTs.
    pub fn known_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes = self.shared.main_dht.known_nodes();
        for dht in self.shared.group_dhts.read().unwrap().values() {
            nodes.extend(dht.known_nodes());
        }
        nodes
    }

    /// Known peers that currently have a live session.
    pub fn active_sessions(&self) -> Vec<NodeInfo> {
        let sessions = self.shared.sessions.read().unwrap();
        self.known_nodes()
            .into_iter()
            .filter(|n| sessions.contains_key(&n.id.digest))
            .collect()
    }

    /// Store a value on the k nodes nearest to the key, via the main DHT.
    pub async fn store_value(&self, key: &str, value: &str) {
        self.shared.main_dht.store_value(key, value).await;
    }

    /// Resolve a value through the main DHT.
    pub async fn load_value(&self, key: &str) -> Option<String> {
        self.shared.main_dht.load_value(key).await
    }

    /// Signal every task to stop and tear down the transport. Readers exit
    /// as their connections close, which closes the receive channel.
    pub fn close(&self) {
        let _ = self.shared.shutdown.send(true);
        self.shared.recv_tx.lock().unwrap().take();
        for session in self.shared.sessions.read().unwrap().values() {
            session.close();
        }
        self.shared.endpoint.close(0u32.into(), b"router closed");
    }
}

impl Shared {
    fn discover(self: &Arc<Self>, addrs: &[SocketAddr]) {
        for &addr in addrs {
            let main = self.main_dht.clone();
            tokio::spawn(async move {
                main.discover(addr).await;
            });
            for dht in self.group_dhts.read().unwrap().values() {
                let dht = dht.clone();
                tokio::spawn(async move {
                    dht.discover(addr).await;
                });
            }
            debug!(addr = %addr, "sent discovery probes");
        }
    }

    fn all_dhts(&self) -> Vec<Arc<Dht>> {
        let mut dhts = vec![self.main_dht.clone()];
        dhts.extend(self.group_dhts.read().unwrap().values().cloned());
        dhts
    }

    /// Register a session unless the peer already has one; the duplicate is
    /// closed. Returns the session that won.
    fn adopt_session(self: &Arc<Self>, session: Arc<Session>) -> Arc<Session> {
        let winner = {
            let mut sessions = self.sessions.write().unwrap();
            match sessions.get(&session.id()) {
                Some(existing) => {
                    session.close();
                    existing.clone()
                }
                None => {
                    sessions.insert(session.id(), session.clone());
                    tokio::spawn(read_session(self.clone(), session.clone()));
                    session
                }
            }
        };
        winner
    }

    fn remove_session(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(current) = sessions.get(&session.id()) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(&session.id());
            }
        }
        session.close();
    }

    /// Sessions a packet for `dst` should be written to: one direct session
    /// for a peer, one per member for a joined group.
    async fn get_sessions(self: &Arc<Self>, dst: &NodeId) -> Vec<Arc<Session>> {
        if dst.ns.is_global() {
            return self.get_direct_session(*dst).await.into_iter().collect();
        }
        let members = match self.group_dhts.read().unwrap().get(&dst.digest) {
            Some(dht) => dht.known_nodes(),
            None => return Vec::new(),
        };
        let mut sessions = Vec::new();
        for member in members {
            if member.id.digest == self.self_id.digest {
                continue;
            }
            if let Some(session) = self.get_direct_session(member.id).await {
                sessions.push(session);
            }
        }
        sessions
    }

    /// Existing session to a peer, or a fresh dial through DHT resolution.
    async fn get_direct_session(self: &Arc<Self>, id: NodeId) -> Option<Arc<Session>> {
        if let Some(session) = self.sessions.read().unwrap().get(&id.digest) {
            return Some(session.clone());
        }

        let mut info = self.main_dht.get_node_info(&id);
        if info.is_none() {
            for dht in self.group_dhts.read().unwrap().values() {
                info = dht.get_node_info(&id);
                if info.is_some() {
                    break;
                }
            }
        }
        let info = info?;

        let dial = Session::connect(
            &self.endpoint,
            self.client_config.clone(),
            info.addr,
            id.digest,
        );
        match timeout(DIAL_TIMEOUT, dial).await {
            Ok(Ok(session)) => Some(self.adopt_session(Arc::new(session))),
            Ok(Err(e)) => {
                debug!(peer = %id, addr = %info.addr, error = %e, "dial failed");
                None
            }
            Err(_) => {
                debug!(peer = %id, addr = %info.addr, "dial timed out");
                None
            }
        }
    }

    /// Write a packet to every session for its destination, queueing on
    /// failure. Liveness pings are never queued.
    async fn dispatch(self: &Arc<Self>, packet: Packet, queued: &mut Vec<Packet>) {
        if !packet.dst.ns.is_global() && packet.src.digest == self.self_id.digest {
            // Our own group broadcast; remember it so echoes are not
            // re-forwarded or self-delivered.
            self.mark_seen(&packet);
        }

        let sessions = self.get_sessions(&packet.dst).await;
        if sessions.is_empty() {
            warn!(dst = %packet.dst, "route not found");
            if packet.kind != KIND_PING {
                queued.push(packet);
            }
            return;
        }
        for session in sessions {
            if let Err(e) = session.write(&packet).await {
                warn!(peer = %session.id(), error = %e, "removing session after write failure");
                self.remove_session(&session);
                if packet.kind != KIND_PING {
                    queued.push(packet.clone());
                }
            }
        }
    }

    /// Probe every live session; failures drop the session on the spot.
    async fn ping_sessions(self: &Arc<Self>) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.read().unwrap().values().cloned().collect();
        for session in sessions {
            let packet = Packet::new(
                NodeId::global(session.id()),
                self.self_id.digest,
                KIND_PING,
                Vec::new(),
            );
            if let Err(e) = session.write(&packet).await {
                debug!(peer = %session.id(), error = %e, "removing session after failed ping");
                self.remove_session(&session);
            }
        }
    }

    fn mark_seen(&self, packet: &Packet) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(packet.src.digest.as_bytes());
        hasher.update(packet.dst.digest.as_bytes());
        hasher.update(&packet.payload);
        let key = Digest::from_bytes(hasher.finalize().into());
        self.seen_forwards.lock().unwrap().put(key, ()).is_some()
    }

    /// Inbound packet from a session reader: group packets are re-broadcast
    /// within their TTL budget, `msg` packets are delivered upward.
    async fn handle_inbound(self: &Arc<Self>, mut packet: Packet) {
        if !packet.src.ns.is_global() {
            let already_seen = self.mark_seen(&packet);
            if already_seen {
                return;
            }
            packet.ttl = packet.ttl.saturating_sub(1);
            if packet.ttl > 0 {
                let members = self
                    .group_dhts
                    .read()
                    .unwrap()
                    .get(&packet.dst.digest)
                    .map(|dht| dht.known_nodes());
                if let Some(members) = members {
                    for member in members {
                        if member.id.digest == self.self_id.digest
                            || member.id.digest == packet.src.digest
                        {
                            continue;
                        }
                        if let Some(session) = self.get_direct_session(member.id).await {
                            if let Err(e) = session.write(&packet).await {
                                debug!(peer = %member.id, error = %e, "group forward failed");
                                self.remove_session(&session);
                            }
                        }
                    }
                }
            }
            if packet.src.digest == self.self_id.digest {
                return;
            }
        }

        if packet.kind == KIND_MSG {
            let id = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .to_be_bytes()
                .to_vec();
            let message = Message {
                node: packet.src,
                payload: packet.payload.into_vec(),
                id,
            };
            let tx = self.recv_tx.lock().unwrap().clone();
            match tx {
                Some(tx) => {
                    if tx.send(message).await.is_err() {
                        debug!("receive channel closed, dropping message");
                    }
                }
                None => debug!("router closed, dropping message"),
            }
        }
    }
}

async fn accept_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            incoming = shared.endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let shared = shared.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => match Session::accept(conn).await {
                            Ok(session) => {
                                debug!(peer = %session.id(), "accepted session");
                                shared.adopt_session(Arc::new(session));
                            }
                            Err(e) => debug!(error = %e, "inbound session failed"),
                        },
                        Err(e) => debug!(error = %e, "inbound connection failed"),
                    }
                });
            }
        }
    }
}

async fn dgram_loop(shared: Arc<Shared>, mut dgram_rx: mpsc::Receiver<Datagram>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            datagram = dgram_rx.recv() => {
                let Some((payload, src)) = datagram else { break };
                for dht in shared.all_dhts() {
                    dht.process_packet(&payload, src).await;
                }
            }
        }
    }
}

async fn read_session(shared: Arc<Shared>, session: Arc<Session>) {
    loop {
        match session.read().await {
            Ok(packet) => shared.handle_inbound(packet).await,
            Err(e) => {
                debug!(peer = %session.id(), error = %e, "session reader exiting");
                shared.remove_session(&session);
                return;
            }
        }
    }
}

async fn main_loop(shared: Arc<Shared>, mut send_rx: mpsc::Receiver<Packet>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut queued: Vec<Packet> = Vec::new();
    let mut interval = tokio::time::interval(RETRY_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            packet = send_rx.recv() => {
                let Some(packet) = packet else { break };
                shared.dispatch(packet, &mut queued).await;
            }
            _ = interval.tick() => {
                ticks += 1;
                shared.ping_sessions().await;

                let pending = std::mem::take(&mut queued);
                for packet in pending {
                    for dht in shared.all_dhts() {
                        dht.find_nearest_node(packet.dst).await;
                    }
                    shared.dispatch(packet, &mut queued).await;
                }

                if ticks % REFRESH_EVERY_TICKS == 0 {
                    for dht in shared.all_dhts() {
                        dht.refresh().await;
                    }
                }
            }
        }
    }
    debug!("router main loop exited");
}
