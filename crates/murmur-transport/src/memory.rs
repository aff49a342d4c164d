//! In-process [`Transport`] for tests, demos and single-host rooms.
//!
//! A [`MemoryHub`] stands in for the gossip network: every payload published
//! on a topic is copied to every other attached peer subscribed to it. A
//! delivery filter can drop or hold individual copies, and held copies can
//! later be released in a different order, which is enough to exercise loss
//! and reordering deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::{PeerEvent, Result, Subscription, Transport, TransportError};

/// Capacity of each peer's connectivity event channel.
const PEER_EVENT_CAPACITY: usize = 64;

/// One copy of a published payload on its way to one peer.
#[derive(Debug)]
pub struct Delivery<'a> {
    /// Publishing peer.
    pub from: &'a str,
    /// Receiving peer.
    pub to: &'a str,
    /// Topic.
    pub topic: &'a str,
    /// Payload.
    pub data: &'a [u8],
}

/// What the hub does with one [`Delivery`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Hand it to the receiver now.
    Deliver,
    /// Lose it.
    Drop,
    /// Keep it until [`MemoryHub::release_held`].
    Hold,
}

/// Order in which held deliveries are released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOrder {
    /// Oldest first.
    Fifo,
    /// Newest first.
    Reversed,
}

/// Delivery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Copies handed to a receiver.
    pub delivered: u64,
    /// Copies dropped by the filter.
    pub dropped: u64,
    /// Copies currently held.
    pub held: u64,
}

type Filter = Arc<dyn Fn(&Delivery<'_>) -> Verdict + Send + Sync>;

struct PeerSlot {
    events: broadcast::Sender<PeerEvent>,
    topics: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

struct Held {
    to: String,
    topic: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    peers: BTreeMap<String, PeerSlot>,
    filter: Option<Filter>,
    held: Vec<Held>,
    stats: HubStats,
}

impl HubState {
    fn deliver(&mut self, to: &str, topic: &str, data: Vec<u8>) {
        let Some(slot) = self.peers.get_mut(to) else {
            return;
        };
        let Some(subscribers) = slot.topics.get_mut(topic) else {
            return;
        };
        subscribers.retain(|tx| tx.send(data.clone()).is_ok());
        if subscribers.is_empty() {
            slot.topics.remove(topic);
        }
        self.stats.delivered += 1;
    }

    /// Forget subscriptions to `topic` whose receiver has been dropped.
    fn prune(&mut self, topic: &str) {
        for slot in self.peers.values_mut() {
            if let Some(subscribers) = slot.topics.get_mut(topic) {
                subscribers.retain(|tx| !tx.is_closed());
                if subscribers.is_empty() {
                    slot.topics.remove(topic);
                }
            }
        }
    }

    fn notify(&self, to: &str, event: PeerEvent) {
        if let Some(slot) = self.peers.get(to) {
            // No receivers yet is fine.
            let _ = slot.events.send(event);
        }
    }
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, HubState>> {
        self.state.lock().map_err(|_| TransportError::Closed)
    }

    /// Attach a new peer. Every already attached peer sees it connect.
    pub fn connect(&self) -> Result<MemoryTransport> {
        let mut state = self.state()?;
        state.next_id += 1;
        let id = format!("peer-{}", state.next_id);
        let (events, _) = broadcast::channel(PEER_EVENT_CAPACITY);
        state.peers.insert(
            id.clone(),
            PeerSlot {
                events: events.clone(),
                topics: HashMap::new(),
            },
        );
        let others: Vec<String> = state.peers.keys().filter(|p| **p != id).cloned().collect();
        for other in &others {
            state.notify(
                other,
                PeerEvent::Connected {
                    peer_id: id.clone(),
                },
            );
        }
        debug!(peer = %id, "peer attached to memory hub");
        Ok(MemoryTransport {
            id,
            hub: self.clone(),
            events,
        })
    }

    /// Re-announce `peer_id` to every other peer, as a reconnect would.
    pub fn announce(&self, peer_id: &str) -> Result<()> {
        let state = self.state()?;
        if !state.peers.contains_key(peer_id) {
            return Err(TransportError::Closed);
        }
        for other in state.peers.keys().filter(|p| p.as_str() != peer_id) {
            state.notify(
                other,
                PeerEvent::Connected {
                    peer_id: peer_id.to_string(),
                },
            );
            state.notify(
                peer_id,
                PeerEvent::Connected {
                    peer_id: other.clone(),
                },
            );
        }
        Ok(())
    }

    /// Detach `peer_id`. Its subscriptions end and other peers see it leave.
    pub fn disconnect(&self, peer_id: &str) -> Result<()> {
        let mut state = self.state()?;
        if state.peers.remove(peer_id).is_none() {
            return Ok(());
        }
        let others: Vec<String> = state.peers.keys().cloned().collect();
        for other in &others {
            state.notify(
                other,
                PeerEvent::Disconnected {
                    peer_id: peer_id.to_string(),
                },
            );
        }
        debug!(peer = peer_id, "peer detached from memory hub");
        Ok(())
    }

    /// Install a delivery filter. The filter runs with the hub locked and
    /// must not call back into the hub.
    pub fn set_filter<F>(&self, filter: F) -> Result<()>
    where
        F: Fn(&Delivery<'_>) -> Verdict + Send + Sync + 'static,
    {
        self.state()?.filter = Some(Arc::new(filter));
        Ok(())
    }

    /// Remove the delivery filter.
    pub fn clear_filter(&self) -> Result<()> {
        self.state()?.filter = None;
        Ok(())
    }

    /// Deliver every held copy. Returns how many were released.
    pub fn release_held(&self, order: ReleaseOrder) -> Result<usize> {
        let mut state = self.state()?;
        let mut held = std::mem::take(&mut state.held);
        if order == ReleaseOrder::Reversed {
            held.reverse();
        }
        let count = held.len();
        for item in held {
            state.deliver(&item.to, &item.topic, item.data);
        }
        state.stats.held = 0;
        Ok(count)
    }

    /// Delivery counters.
    pub fn stats(&self) -> Result<HubStats> {
        Ok(self.state()?.stats)
    }

    fn publish(&self, from: &str, topic: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.state()?;
        if !state.peers.contains_key(from) {
            return Err(TransportError::Closed);
        }
        state.prune(topic);
        let filter = state.filter.clone();
        let targets: Vec<String> = state
            .peers
            .iter()
            .filter(|(id, slot)| id.as_str() != from && slot.topics.contains_key(topic))
            .map(|(id, _)| id.clone())
            .collect();

        for to in targets {
            let verdict = match &filter {
                Some(filter) => filter(&Delivery {
                    from,
                    to: &to,
                    topic,
                    data: &data,
                }),
                None => Verdict::Deliver,
            };
            match verdict {
                Verdict::Deliver => state.deliver(&to, topic, data.clone()),
                Verdict::Drop => {
                    trace!(from, to = %to, topic, "delivery dropped");
                    state.stats.dropped += 1;
                }
                Verdict::Hold => {
                    state.held.push(Held {
                        to,
                        topic: topic.to_string(),
                        data: data.clone(),
                    });
                    state.stats.held += 1;
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, peer_id: &str, topic: &str) -> Result<Subscription> {
        let mut state = self.state()?;
        let slot = state.peers.get_mut(peer_id).ok_or(TransportError::Closed)?;
        let (tx, rx) = mpsc::unbounded_channel();
        slot.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(Subscription::new(topic, rx))
    }
}

/// One peer's attachment to a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    id: String,
    hub: MemoryHub,
    events: broadcast::Sender<PeerEvent>,
}

impl MemoryTransport {
    /// The hub this peer is attached to.
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn peer_id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.hub.subscribe(&self.id, topic)
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        self.hub.publish(&self.id, topic, data)
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}
