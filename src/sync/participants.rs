//! Registry of connected clients and their outbound channels.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::protocol::ServerMessage;
use super::{ClientId, SyncError, SyncResult};

/// A single client connection
pub struct PeerConnection {
    /// Unique client identifier
    pub client_id: ClientId,
    /// Display name sent in `Hello`
    pub name: String,
    /// Channel to send messages to this client
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Last activity timestamp
    last_active: Instant,
}

impl PeerConnection {
    pub fn new(client_id: impl Into<String>, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            client_id: client_id.into(),
            name: String::new(),
            tx,
            last_active: Instant::now(),
        }
    }

    /// Send a message to this client
    pub fn send(&self, msg: ServerMessage) -> Result<(), SyncError> {
        self.tx
            .send(msg)
            .map_err(|_| SyncError::ConnectionError("Channel closed".to_string()))
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Check if the connection is stale
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }
}

/// Connected clients, shared by everything that broadcasts.
#[derive(Default)]
pub struct Participants {
    peers: DashMap<ClientId, PeerConnection>,
}

impl Participants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        debug!("Registered client: {}", client_id);
        self.peers
            .insert(client_id.to_string(), PeerConnection::new(client_id, tx));
    }

    pub fn unregister(&self, client_id: &str) -> bool {
        self.peers.remove(client_id).is_some()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.peers.contains_key(client_id)
    }

    pub fn set_name(&self, client_id: &str, name: &str) {
        if let Some(mut peer) = self.peers.get_mut(client_id) {
            peer.name = name.to_string();
        }
    }

    pub fn touch(&self, client_id: &str) {
        if let Some(mut peer) = self.peers.get_mut(client_id) {
            peer.touch();
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Send to one client
    pub fn send_to(&self, client_id: &str, msg: ServerMessage) -> SyncResult<()> {
        let peer = self
            .peers
            .get(client_id)
            .ok_or_else(|| SyncError::ClientNotFound(client_id.to_string()))?;
        peer.send(msg)
    }

    /// Send to each of `recipients` except `exclude`
    pub fn broadcast_to<'a, I>(&self, recipients: I, exclude: &str, msg: &ServerMessage) -> usize
    where
        I: IntoIterator<Item = &'a ClientId>,
    {
        let mut delivered = 0;
        for client_id in recipients {
            if client_id == exclude {
                continue;
            }
            match self.send_to(client_id, msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send to client {}: {}", client_id, e),
            }
        }
        delivered
    }

    /// Send to every connected client except `exclude`
    pub fn broadcast_all(&self, exclude: &str, msg: &ServerMessage) -> usize {
        let mut delivered = 0;
        for entry in self.peers.iter() {
            if entry.key() == exclude {
                continue;
            }
            match entry.send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send to client {}: {}", entry.key(), e),
            }
        }
        delivered
    }

    /// Ids of connections idle for longer than `timeout`
    pub fn stale_clients(&self, timeout: Duration) -> Vec<ClientId> {
        self.peers
            .iter()
            .filter(|entry| entry.is_stale(timeout))
            .map(|entry| entry.key().clone())
            .collect()
    }
}
