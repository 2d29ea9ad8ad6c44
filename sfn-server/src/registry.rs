//! Registry of accepted peers.
//!
//! Every accepted connection is registered under the name from its handshake.
//! Writes to a peer go through a bounded queue drained by that connection's
//! writer task, so any read loop may forward to any peer without sharing the
//! QUIC send stream.

use crate::error::ServerError;
use bytes::Bytes;
use dashmap::DashMap;
use sfn_protocol::{ClientType, HandshakeFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Frames queued per peer before forwarding waits on the transport.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Identity of an accepted peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Unique per connection; a reconnect under the same name gets a new id.
    pub id: Uuid,
    pub name: String,
    pub client_type: ClientType,
    pub app_id: String,
    pub observe_data_tags: Vec<u8>,
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
}

impl PeerInfo {
    pub fn from_handshake(handshake: &HandshakeFrame, remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: handshake.name.clone(),
            client_type: handshake.client_type,
            app_id: handshake.app_id.clone(),
            observe_data_tags: handshake.observe_data_tags.clone(),
            remote_addr,
            connected_at: Instant::now(),
        }
    }

    /// Whether this peer wants data tagged `tag`. An empty list observes all.
    pub fn observes(&self, tag: u8) -> bool {
        self.observe_data_tags.is_empty() || self.observe_data_tags.contains(&tag)
    }
}

/// A registered peer and its outbound queue.
#[derive(Debug)]
pub struct Peer {
    info: PeerInfo,
    outbound: mpsc::Sender<Bytes>,
    evicted: Notify,
}

impl Peer {
    pub fn new(info: PeerInfo, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            info,
            outbound,
            evicted: Notify::new(),
        }
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn observes(&self, tag: u8) -> bool {
        self.info.observes(tag)
    }

    /// Queues an encoded frame, waiting while the queue is full.
    pub async fn send(&self, frame: Bytes) -> Result<(), ServerError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ServerError::PeerClosed(self.info.name.clone()))
    }

    /// Asks the owning connection task to close this connection.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Completes once [`Peer::evict`] has been called.
    pub async fn evicted(&self) {
        self.evicted.notified().await
    }
}

/// Concurrent map of peer name to peer.
#[derive(Debug, Default)]
pub struct Registry {
    peers: DashMap<String, Arc<Peer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `peer` under its name.
    ///
    /// A peer already registered under the same name is evicted and returned.
    pub fn register(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        let previous = self.peers.insert(peer.name().to_string(), peer);
        if let Some(ref old) = previous {
            tracing::info!(
                "[{}] Peer '{}' replaced by a newer connection",
                old.info().remote_addr,
                old.name()
            );
            old.evict();
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.get(name).map(|p| p.clone())
    }

    /// Removes `name` only while it still maps to connection `id`.
    pub fn remove(&self, name: &str, id: Uuid) -> bool {
        self.peers.remove_if(name, |_, p| p.id() == id).is_some()
    }

    /// Registered peers with the given role.
    pub fn by_type(&self, client_type: ClientType) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|p| p.info().client_type == client_type)
            .map(|p| p.clone())
            .collect()
    }

    /// Point-in-time copy of every registered peer's identity.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.iter().map(|p| p.info().clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
