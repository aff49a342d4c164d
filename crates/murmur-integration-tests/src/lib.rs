//! Integration test helpers for murmur.
//!
//! Every test runs several [`Node`]s in one process over a shared
//! [`MemoryHub`], each with its own store, and drives them through the
//! public room API. The hub's delivery filter injects loss and reordering.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p murmur-integration-tests
//! ```

use std::sync::Arc;
use std::time::Duration;

use murmur_db::memory::MemoryStore;
use murmur_db::KvStore;
use murmur_node::{Event, EventKind, Node, NodeConfig, RoomHandle, RoomSnapshot};
use murmur_transport::memory::MemoryHub;
use murmur_transport::wire::Envelope;
use murmur_transport::Transport;
use tokio::sync::broadcast::{self, error::RecvError};

/// Room topic used by the tests.
pub const ROOM: &str = "lobby";

/// Upper bound for any single wait.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Config with a short rebroadcast interval.
pub fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.protocol.rebroadcast_interval_ms = 50;
    config
}

/// One node plus the pieces tests poke at directly.
pub struct Peer {
    pub node: Node,
    pub store: Arc<dyn KvStore>,
    pub peer_id: String,
    pub events: broadcast::Receiver<Event>,
}

impl Peer {
    /// Attach a node with the given store to `hub`.
    pub fn start(hub: &MemoryHub, store: Arc<dyn KvStore>, config: NodeConfig) -> Self {
        let transport = hub.connect().expect("connect to hub");
        let peer_id = transport.peer_id().to_string();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let node = Node::start(store.clone(), transport, config).expect("start node");
        let events = node.events().subscribe();
        Self {
            node,
            store,
            peer_id,
            events,
        }
    }

    pub fn fp(&self) -> String {
        self.node.fingerprint().to_string()
    }

    /// Wait for the first event on this peer matching `pred`.
    pub async fn wait_for(&mut self, what: &str, pred: impl Fn(&EventKind) -> bool) -> Event {
        wait_for_event(&mut self.events, what, pred).await
    }
}

/// `n` peers on fresh stores, sorted by fingerprint so `peers[0]` is the
/// owner of any room they all join.
pub fn peers(hub: &MemoryHub, n: usize, config: &NodeConfig) -> Vec<Peer> {
    let mut peers: Vec<Peer> = (0..n)
        .map(|_| Peer::start(hub, Arc::new(MemoryStore::new()), config.clone()))
        .collect();
    peers.sort_by_key(Peer::fp);
    peers
}

/// Wait for the first event matching `pred`, panicking after [`TIMEOUT`].
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<Event>,
    what: &str,
    pred: impl Fn(&EventKind) -> bool,
) -> Event {
    let search = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event.kind) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed while waiting for {what}"),
            }
        }
    };
    tokio::time::timeout(TIMEOUT, search)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Poll `handle` until its snapshot satisfies `pred`.
pub async fn wait_for_snapshot(
    handle: &RoomHandle,
    what: &str,
    pred: impl Fn(&RoomSnapshot) -> bool,
) -> RoomSnapshot {
    let poll = async {
        loop {
            let snapshot = handle.snapshot().await.expect("snapshot");
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Envelope type of a payload seen by the hub filter.
pub fn envelope_kind(data: &[u8]) -> Option<&'static str> {
    Envelope::from_bytes(data).ok().map(|e| e.kind())
}

/// Owner `peers[0]` creates [`ROOM`]; every other peer joins and is approved.
pub async fn admitted_room(peers: &mut [Peer]) -> Vec<RoomHandle> {
    let (owner, joiners) = peers.split_first_mut().expect("at least one peer");
    let owner_room = owner
        .node
        .open_room(ROOM, murmur_node::RoomMode::Create)
        .await
        .expect("create room");
    let mut handles = vec![owner_room.clone()];
    for joiner in joiners.iter_mut() {
        let handle = joiner
            .node
            .open_room(ROOM, murmur_node::RoomMode::Join)
            .await
            .expect("join room");
        let fp = joiner.fp();
        owner
            .wait_for("join request", |k| {
                matches!(k, EventKind::JoinRequested { fingerprint } if *fingerprint == fp)
            })
            .await;
        owner_room.approve(&fp).await.expect("approve");
        joiner
            .wait_for("admission", |k| matches!(k, EventKind::Admitted { .. }))
            .await;
        handles.push(handle);
    }
    handles
}
