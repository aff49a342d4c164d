//! Per-room session actor.
//!
//! Each joined room runs as one task that owns the room's [`RoomContext`]
//! and serializes three inputs: envelopes from the transport, commands
//! from [`RoomHandle`]s, and peer-connected notifications. An input is
//! fully applied, and its replies published, before the next is read.

use std::sync::Arc;
use std::time::Duration;

use murmur_transport::wire::Envelope;
use murmur_transport::{PeerEvent, Subscription, Transport};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventKind;
use crate::handlers::RoomContext;
use crate::node::RoomMode;
use crate::rebroadcast::Rebroadcast;
use crate::{NodeConfig, NodeError, ProtocolError};

type Reply<T> = oneshot::Sender<Result<T, ProtocolError>>;

/// Point-in-time view of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room: String,
    /// Local fingerprint.
    pub fingerprint: String,
    pub owner: String,
    pub is_owner: bool,
    pub members: Vec<String>,
    pub pending: Vec<String>,
    pub key_id: Option<String>,
}

/// Requests a handle can make of its session.
enum Command {
    Approve { fingerprint: String, reply: Reply<()> },
    Reject { fingerprint: String, reply: Reply<()> },
    Kick { fingerprint: String, reply: Reply<String> },
    RotateKey { reply: Reply<String> },
    SendGroup { text: String, reply: Reply<()> },
    SendDirect { to: String, text: String, reply: Reply<()> },
    RequestJoin { reply: Reply<()> },
    Snapshot { reply: Reply<RoomSnapshot> },
}

/// Cloneable control surface for a running room session.
#[derive(Clone)]
pub struct RoomHandle {
    room: String,
    commands: mpsc::Sender<Command>,
    token: CancellationToken,
}

impl RoomHandle {
    /// Room name.
    pub fn room(&self) -> &str {
        &self.room
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ProtocolError::SessionClosed)?;
        rx.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    /// Admit a peer and send it the room key. Owner only.
    pub async fn approve(&self, fingerprint: &str) -> Result<(), ProtocolError> {
        let fingerprint = fingerprint.to_string();
        self.request(|reply| Command::Approve { fingerprint, reply }).await
    }

    /// Decline a pending join request. Owner only.
    pub async fn reject(&self, fingerprint: &str) -> Result<(), ProtocolError> {
        let fingerprint = fingerprint.to_string();
        self.request(|reply| Command::Reject { fingerprint, reply }).await
    }

    /// Remove a member and rotate the key. Returns the new key id. Owner only.
    pub async fn kick(&self, fingerprint: &str) -> Result<String, ProtocolError> {
        let fingerprint = fingerprint.to_string();
        self.request(|reply| Command::Kick { fingerprint, reply }).await
    }

    /// Rotate the key without changing membership. Owner only.
    pub async fn rotate_key(&self) -> Result<String, ProtocolError> {
        self.request(|reply| Command::RotateKey { reply }).await
    }

    /// Send a message to the room.
    pub async fn send(&self, text: &str) -> Result<(), ProtocolError> {
        let text = text.to_string();
        self.request(|reply| Command::SendGroup { text, reply }).await
    }

    /// Send a direct message to one pinned peer over the room topic.
    pub async fn send_dm(&self, to: &str, text: &str) -> Result<(), ProtocolError> {
        let (to, text) = (to.to_string(), text.to_string());
        self.request(|reply| Command::SendDirect { to, text, reply }).await
    }

    /// Ask to join again, e.g. after a rejection. No-op once admitted.
    pub async fn request_join(&self) -> Result<(), ProtocolError> {
        self.request(|reply| Command::RequestJoin { reply }).await
    }

    /// Current room state.
    pub async fn snapshot(&self) -> Result<RoomSnapshot, ProtocolError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the session. Stored room state is kept.
    pub fn leave(&self) {
        self.token.cancel();
    }

    /// Whether the session has stopped.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.commands.is_closed()
    }
}

pub(crate) struct RoomSession {
    ctx: RoomContext,
    transport: Arc<dyn Transport>,
    topic: String,
    subscription: Subscription,
    commands: mpsc::Receiver<Command>,
    peer_events: broadcast::Receiver<PeerEvent>,
    token: CancellationToken,
    bootstrap: Option<Rebroadcast>,
    rebroadcast_interval: Duration,
    rejected: bool,
}

impl RoomSession {
    /// Subscribe, announce ourselves and spawn the session task.
    pub(crate) async fn start(
        ctx: RoomContext,
        transport: Arc<dyn Transport>,
        mode: RoomMode,
        config: &NodeConfig,
        parent: &CancellationToken,
    ) -> Result<RoomHandle, NodeError> {
        let topic = ctx.room().name().to_string();
        let subscription = transport.subscribe(&topic).await?;
        let peer_events = transport.peer_events();

        ctx.room().add_member(ctx.fingerprint())?;
        if mode == RoomMode::Create {
            let key = ctx.room().ensure_room_key()?;
            info!(room = %topic, key_id = key.key_id(), "room created");
        }
        let keyless = !ctx.room().has_key()?;

        let (tx, rx) = mpsc::channel(config.protocol.command_buffer.max(1));
        let token = parent.child_token();
        let mut session = Self {
            ctx,
            transport,
            topic: topic.clone(),
            subscription,
            commands: rx,
            peer_events,
            token: token.clone(),
            bootstrap: None,
            rebroadcast_interval: config.rebroadcast_interval(),
            rejected: false,
        };

        session.publish(&session.ctx.handshake()).await;
        if keyless {
            session.publish(&session.ctx.join_request()).await;
            session.start_bootstrap();
        }

        let owner = session
            .ctx
            .room()
            .owner_fingerprint(session.ctx.fingerprint())?;
        info!(room = %topic, fingerprint = session.ctx.fingerprint(), owner = %owner, keyless, "joined room");
        session.ctx.emit(EventKind::Connected { owner });

        tokio::spawn(session.run());
        Ok(RoomHandle {
            room: topic,
            commands: tx,
            token,
        })
    }

    async fn run(mut self) {
        let mut peer_events_open = true;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                inbound = self.subscription.recv() => match inbound {
                    Some(bytes) => self.on_inbound(&bytes).await,
                    None => {
                        warn!(room = %self.topic, "subscription closed by transport");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                event = self.peer_events.recv(), if peer_events_open => match event {
                    Ok(PeerEvent::Connected { peer_id }) => self.on_peer_connected(&peer_id).await,
                    Ok(PeerEvent::Disconnected { peer_id }) => {
                        debug!(room = %self.topic, peer_id = %peer_id, "peer disconnected");
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!(room = %self.topic, missed, "peer events lagged");
                        self.on_peer_connected("unknown").await;
                    }
                    Err(RecvError::Closed) => peer_events_open = false,
                },
            }
        }

        if let Some(bootstrap) = self.bootstrap.take() {
            bootstrap.stop().await;
        }
        self.token.cancel();
        info!(room = %self.topic, "left room");
        self.ctx.emit(EventKind::Left);
    }

    async fn publish(&self, envelope: &Envelope) {
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(room = %self.topic, kind = envelope.kind(), error = %e, "failed to encode envelope");
                return;
            }
        };
        if let Err(e) = self.transport.publish(&self.topic, bytes).await {
            warn!(room = %self.topic, kind = envelope.kind(), error = %e, "publish failed");
        }
    }

    async fn publish_all(&self, envelopes: &[Envelope]) {
        for envelope in envelopes {
            self.publish(envelope).await;
        }
    }

    fn start_bootstrap(&mut self) {
        if self.bootstrap.as_ref().is_some_and(|b| !b.is_cancelled()) {
            return;
        }
        let frames: Result<Vec<_>, _> = [self.ctx.handshake(), self.ctx.join_request()]
            .iter()
            .map(Envelope::to_bytes)
            .collect();
        match frames {
            Ok(frames) => {
                self.bootstrap = Some(Rebroadcast::spawn(
                    self.transport.clone(),
                    self.topic.clone(),
                    frames,
                    self.rebroadcast_interval,
                    &self.token,
                ));
            }
            Err(e) => warn!(room = %self.topic, error = %e, "cannot start rebroadcast"),
        }
    }

    fn stop_bootstrap(&mut self) {
        if let Some(bootstrap) = self.bootstrap.take() {
            bootstrap.cancel();
            debug!(room = %self.topic, "rebroadcast cancelled");
        }
    }

    async fn on_inbound(&mut self, bytes: &[u8]) {
        match self.ctx.handle_bytes(bytes) {
            Ok(outcome) => {
                self.publish_all(&outcome.replies).await;
                if outcome.admitted {
                    self.rejected = false;
                    self.stop_bootstrap();
                }
                if outcome.rejected {
                    self.rejected = true;
                    self.stop_bootstrap();
                }
            }
            Err(e) => self.ctx.report(&e),
        }
    }

    async fn on_peer_connected(&mut self, peer_id: &str) {
        debug!(room = %self.topic, peer_id, "peer connected, re-announcing");
        self.publish(&self.ctx.handshake()).await;
        match self.ctx.room().has_key() {
            Ok(false) if !self.rejected => self.publish(&self.ctx.join_request()).await,
            Ok(_) => {}
            Err(e) => self.ctx.report(&ProtocolError::from(e)),
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Approve { fingerprint, reply } => {
                let result = match self.ctx.approve(&fingerprint) {
                    Ok(grants) => {
                        self.publish_all(&grants).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Reject { fingerprint, reply } => {
                let result = match self.ctx.reject(&fingerprint) {
                    Ok(rejection) => {
                        self.publish(&rejection).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Kick { fingerprint, reply } => {
                let result = match self.ctx.kick(&fingerprint) {
                    Ok((key_id, grants)) => {
                        self.publish_all(&grants).await;
                        Ok(key_id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::RotateKey { reply } => {
                let result = match self.ctx.rotate() {
                    Ok((key_id, grants)) => {
                        self.publish_all(&grants).await;
                        Ok(key_id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::SendGroup { text, reply } => {
                let result = match self.ctx.send_group(&text) {
                    Ok(message) => {
                        self.publish(&message).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::SendDirect { to, text, reply } => {
                let result = match self.ctx.send_direct(&to, &text) {
                    Ok(message) => {
                        self.publish(&message).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::RequestJoin { reply } => {
                let result = match self.ctx.room().has_key() {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        self.rejected = false;
                        self.publish(&self.ctx.handshake()).await;
                        self.publish(&self.ctx.join_request()).await;
                        self.start_bootstrap();
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.ctx.snapshot());
            }
        }
    }
}
