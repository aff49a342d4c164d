//! One local identity attached to one transport.

use std::collections::HashMap;
use std::sync::Arc;

use murmur_db::KvStore;
use murmur_room::Room;
use murmur_transport::Transport;
use murmur_trust::{get_or_create_identity, Identity, TrustStore};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::events::EventBus;
use crate::handlers::RoomContext;
use crate::session::{RoomHandle, RoomSession};
use crate::{NodeConfig, NodeError};

/// How a room is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomMode {
    /// Found the room: generate a key if none is stored.
    Create,
    /// Ask the owner for the key and keep asking until admitted or rejected.
    Join,
}

/// A running peer.
pub struct Node {
    store: Arc<dyn KvStore>,
    transport: Arc<dyn Transport>,
    identity: Arc<Identity>,
    trust: Arc<TrustStore>,
    events: EventBus,
    config: NodeConfig,
    shutdown: CancellationToken,
    rooms: Mutex<HashMap<String, RoomHandle>>,
}

impl Node {
    /// Load or create the identity and get ready to open rooms.
    pub fn start(
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        config: NodeConfig,
    ) -> Result<Self, NodeError> {
        let identity = get_or_create_identity(store.as_ref()).map_err(NodeError::Identity)?;
        info!(
            fingerprint = identity.fingerprint(),
            peer_id = transport.peer_id(),
            "node started"
        );
        Ok(Self {
            trust: Arc::new(TrustStore::new(store.clone())),
            events: EventBus::new(config.protocol.event_buffer.max(1)),
            identity: Arc::new(identity),
            store,
            transport,
            config,
            shutdown: CancellationToken::new(),
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Local fingerprint.
    pub fn fingerprint(&self) -> &str {
        self.identity.fingerprint()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Start a session for `room`, or return the one already running.
    pub async fn open_room(&self, room: &str, mode: RoomMode) -> Result<RoomHandle, NodeError> {
        if self.shutdown.is_cancelled() {
            return Err(NodeError::ShutDown);
        }
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(room) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        let ctx = RoomContext::new(
            Room::new(room, self.store.clone()),
            self.identity.clone(),
            self.trust.clone(),
            self.events.clone(),
        );
        let handle =
            RoomSession::start(ctx, self.transport.clone(), mode, &self.config, &self.shutdown).await?;
        rooms.insert(room.to_string(), handle.clone());
        Ok(handle)
    }

    /// Handle for a running room session.
    pub async fn room(&self, name: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.lock().await;
        rooms.get(name).filter(|h| !h.is_closed()).cloned()
    }

    /// Names of rooms with a running session.
    pub async fn rooms(&self) -> Vec<String> {
        let rooms = self.rooms.lock().await;
        let mut names: Vec<String> = rooms
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Stop one room's session. Returns false if it was not running.
    pub async fn leave_room(&self, name: &str) -> bool {
        match self.rooms.lock().await.remove(name) {
            Some(handle) => {
                let was_running = !handle.is_closed();
                handle.leave();
                was_running
            }
            None => false,
        }
    }

    /// Stop every session and refuse new ones.
    pub fn shutdown(&self) {
        info!(fingerprint = self.fingerprint(), "node shutting down");
        self.shutdown.cancel();
    }
}
