//! Envelope dispatch and owner operations for one room.
//!
//! [`RoomContext`] holds everything needed to process one room's traffic
//! and performs no I/O: each call returns the envelopes to publish. The
//! session actor feeds it one input at a time, which is what makes each
//! envelope's state transition atomic.

use std::sync::Arc;

use murmur_crypto::sealed;
use murmur_crypto::x25519::X25519PublicKey;
use murmur_room::keys::{key_id_at_least, KeyGrant, RoomKey};
use murmur_room::{Room, RoomError};
use murmur_transport::wire::Envelope;
use murmur_trust::{ContactStatus, Identity, TrustStore};
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, EventKind};
use crate::session::RoomSnapshot;
use crate::ProtocolError;

type Result<T> = std::result::Result<T, ProtocolError>;

/// Result of handling one inbound envelope.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Envelopes to publish, in order.
    pub replies: Vec<Envelope>,
    /// A room key was installed.
    pub admitted: bool,
    /// The owner declined this peer's join request.
    pub rejected: bool,
}

impl Outcome {
    fn replies(replies: Vec<Envelope>) -> Self {
        Self {
            replies,
            ..Self::default()
        }
    }
}

/// One room as seen by the local peer.
pub struct RoomContext {
    room: Room,
    identity: Arc<Identity>,
    trust: Arc<TrustStore>,
    events: EventBus,
}

impl RoomContext {
    /// Bind room state, identity, contacts and the event bus together.
    pub fn new(room: Room, identity: Arc<Identity>, trust: Arc<TrustStore>, events: EventBus) -> Self {
        Self {
            room,
            identity,
            trust,
            events,
        }
    }

    /// The room state.
    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Local fingerprint.
    pub fn fingerprint(&self) -> &str {
        self.identity.fingerprint()
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        self.events.emit(Event::now(self.room.name(), kind));
    }

    /// Our `hs` envelope.
    pub fn handshake(&self) -> Envelope {
        Envelope::Handshake {
            fp: self.fingerprint().to_string(),
            pk_b64: self.identity.public_key().to_base64(),
        }
    }

    fn handshake_ack(&self) -> Envelope {
        Envelope::HandshakeAck {
            fp: self.fingerprint().to_string(),
            pk_b64: self.identity.public_key().to_base64(),
        }
    }

    /// Our `join-req` envelope.
    pub fn join_request(&self) -> Envelope {
        Envelope::JoinRequest {
            from: self.fingerprint().to_string(),
        }
    }

    fn pinned(&self, fingerprint: &str) -> Result<X25519PublicKey> {
        self.trust
            .get_pinned_public_key(fingerprint)?
            .ok_or_else(|| ProtocolError::UnknownPeer(fingerprint.to_string()))
    }

    /// Log and surface a failure. Nothing is retried.
    pub fn report(&self, error: &ProtocolError) {
        let room = self.room.name();
        match error {
            ProtocolError::TrustMismatch { fingerprint } => {
                warn!(room, fingerprint = %fingerprint, "trust mismatch, handshake ignored");
                self.emit(EventKind::TrustMismatch {
                    fingerprint: fingerprint.clone(),
                });
            }
            ProtocolError::DecryptFailure { from, reason } => {
                warn!(room, from = %from, reason = %reason, "decryption failed, message dropped");
                self.emit(EventKind::DecryptFailed {
                    from: from.clone(),
                    reason: reason.clone(),
                });
            }
            ProtocolError::StaleKey {
                from,
                received,
                current,
            } => {
                warn!(room, from = %from, received = %received, current = ?current, "stale key, message dropped");
                self.emit(EventKind::StaleKey {
                    from: from.clone(),
                    key_id: received.clone(),
                    current: current.clone(),
                });
            }
            ProtocolError::MalformedEnvelope(reason) => {
                debug!(room, reason = %reason, "dropping malformed envelope");
            }
            ProtocolError::UnknownPeer(fingerprint) => {
                debug!(room, fingerprint = %fingerprint, "dropping message from unpinned peer");
            }
            other => warn!(room, error = %other, "failed to handle envelope"),
        }
    }

    /// Decode and handle raw transport bytes.
    pub fn handle_bytes(&self, bytes: &[u8]) -> Result<Outcome> {
        let envelope = Envelope::from_bytes(bytes)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        self.handle(envelope)
    }

    /// Apply one envelope to room state.
    pub fn handle(&self, envelope: Envelope) -> Result<Outcome> {
        if envelope.sender() == self.fingerprint() {
            return Ok(Outcome::default());
        }
        debug!(room = self.room.name(), kind = envelope.kind(), from = envelope.sender(), "handling envelope");
        match envelope {
            Envelope::Handshake { fp, pk_b64 } => self.on_handshake(&fp, &pk_b64, true),
            Envelope::HandshakeAck { fp, pk_b64 } => self.on_handshake(&fp, &pk_b64, false),
            Envelope::JoinRequest { from } => self.on_join_request(&from),
            Envelope::JoinReject { to, from } => self.on_join_reject(&to, &from),
            Envelope::RoomKey { to, from, body } => self.on_room_key(&to, &from, &body),
            Envelope::GroupChat { from, body, key_id } => self.on_group_chat(&from, &body, &key_id),
            Envelope::Direct { to, from, body } => self.on_direct(&to, &from, &body),
        }
    }

    fn on_handshake(&self, fp: &str, pk_b64: &str, acknowledge: bool) -> Result<Outcome> {
        let public = X25519PublicKey::from_base64(pk_b64)
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("pkB64: {e}")))?;
        match self.trust.add_or_verify_contact(fp, &public)? {
            ContactStatus::Mismatch => Err(ProtocolError::TrustMismatch {
                fingerprint: fp.to_string(),
            }),
            ContactStatus::Exists => Ok(Outcome::default()),
            ContactStatus::Added => {
                info!(room = self.room.name(), fingerprint = fp, "pinned contact");
                self.emit(EventKind::ContactPinned {
                    fingerprint: fp.to_string(),
                });
                let replies = if acknowledge {
                    vec![self.handshake_ack()]
                } else {
                    Vec::new()
                };
                Ok(Outcome::replies(replies))
            }
        }
    }

    fn on_join_request(&self, from: &str) -> Result<Outcome> {
        let me = self.fingerprint();
        if !self.room.is_owner(me)? {
            debug!(room = self.room.name(), from, "join request ignored, not owner");
            return Ok(Outcome::default());
        }
        let Some(key) = self.room.group_key()? else {
            debug!(room = self.room.name(), from, "join request ignored, no room key to grant");
            return Ok(Outcome::default());
        };

        if self.room.is_member(from)? {
            // The member never got its grant, or missed a rotation.
            let Some(public) = self.trust.get_pinned_public_key(from)? else {
                return Ok(Outcome::default());
            };
            let grant = self.grant_json(&key)?;
            debug!(room = self.room.name(), to = from, key_id = key.key_id(), "re-sending room key");
            return Ok(Outcome::replies(vec![self.grant_envelope(from, &public, &grant)?]));
        }

        if self.room.add_pending(from)? {
            info!(room = self.room.name(), from, "join request pending");
            self.emit(EventKind::JoinRequested {
                fingerprint: from.to_string(),
            });
        }
        Ok(Outcome::default())
    }

    fn on_join_reject(&self, to: &str, from: &str) -> Result<Outcome> {
        if to != self.fingerprint() {
            return Ok(Outcome::default());
        }
        if self.room.has_key()? {
            debug!(room = self.room.name(), from, "rejection ignored, already admitted");
            return Ok(Outcome::default());
        }
        info!(room = self.room.name(), by = from, "join request rejected");
        self.emit(EventKind::JoinRejected {
            by: from.to_string(),
        });
        Ok(Outcome {
            rejected: true,
            ..Outcome::default()
        })
    }

    fn on_room_key(&self, to: &str, from: &str, body: &str) -> Result<Outcome> {
        let me = self.fingerprint();
        if to != me {
            return Ok(Outcome::default());
        }
        let public = self.pinned(from)?;
        let plaintext = sealed::open_direct(self.identity.secret(), &public, body).map_err(|e| {
            ProtocolError::DecryptFailure {
                from: from.to_string(),
                reason: e.to_string(),
            }
        })?;
        let grant = KeyGrant::from_json(&plaintext)
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("room key grant: {e}")))?;
        let key = grant
            .room_key()
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("room key grant: {e}")))?;

        let authoritative = self.grant_is_authoritative(from, key.key_id())?;
        self.room.set_group_key_from_owner(&key)?;
        match grant.members {
            Some(members) if authoritative => self
                .room
                .set_members(members.into_iter().chain(std::iter::once(me.to_string())))?,
            members => {
                if members.is_some() {
                    debug!(room = self.room.name(), from, key_id = key.key_id(), "grant member list ignored");
                }
                self.room.add_member(me)?;
                self.room.add_member(from)?;
            }
        }
        self.room.remove_pending(me)?;

        self.emit(EventKind::Admitted {
            key_id: key.key_id().to_string(),
            granted_by: from.to_string(),
        });
        Ok(Outcome {
            admitted: true,
            ..Outcome::default()
        })
    }

    /// Whether a grant from `from` under `key_id` may replace the member set.
    ///
    /// The key id must not be older than the installed one, and `from` must
    /// be the smallest fingerprint other than ours among the known members.
    /// Once we hold a key and sort before `from`, we are the owner and no
    /// one else's member list applies.
    fn grant_is_authoritative(&self, from: &str, key_id: &str) -> Result<bool> {
        let me = self.fingerprint();
        let current = self.room.current_key_id()?;
        if !key_id_at_least(key_id, current.as_deref()) {
            return Ok(false);
        }
        if current.is_some() && me < from {
            return Ok(false);
        }
        let mut known = self.room.members()?;
        known.insert(from.to_string());
        known.remove(me);
        Ok(known.first().map(String::as_str) == Some(from))
    }

    fn on_group_chat(&self, from: &str, body: &str, key_id: &str) -> Result<Outcome> {
        match self.room.decrypt_group(body, key_id) {
            Ok(text) => {
                self.emit(EventKind::GroupMessage {
                    from: from.to_string(),
                    text,
                });
                Ok(Outcome::default())
            }
            Err(RoomError::StaleKey { current, received }) => Err(ProtocolError::StaleKey {
                from: from.to_string(),
                received,
                current: Some(current),
            }),
            Err(RoomError::NoGroupKey) => Err(ProtocolError::StaleKey {
                from: from.to_string(),
                received: key_id.to_string(),
                current: None,
            }),
            Err(RoomError::Decrypt(e)) => Err(ProtocolError::DecryptFailure {
                from: from.to_string(),
                reason: e.to_string(),
            }),
            Err(other) => Err(other.into()),
        }
    }

    fn on_direct(&self, to: &str, from: &str, body: &str) -> Result<Outcome> {
        if to != self.fingerprint() {
            return Ok(Outcome::default());
        }
        let public = self.pinned(from)?;
        let text = sealed::open_direct(self.identity.secret(), &public, body).map_err(|e| {
            ProtocolError::DecryptFailure {
                from: from.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.emit(EventKind::DirectMessage {
            from: from.to_string(),
            text,
        });
        Ok(Outcome::default())
    }

    // ===== Owner operations =====

    fn require_owner(&self) -> Result<()> {
        let owner = self.room.owner_fingerprint(self.fingerprint())?;
        if owner != self.fingerprint() {
            return Err(ProtocolError::NotAuthorized { owner });
        }
        Ok(())
    }

    fn grant_json(&self, key: &RoomKey) -> Result<String> {
        let members = self.room.members()?.into_iter().collect();
        Ok(key.to_grant(Some(members)).to_json()?)
    }

    fn grant_envelope(&self, to: &str, public: &X25519PublicKey, grant: &str) -> Result<Envelope> {
        let body = sealed::seal_direct(self.identity.secret(), public, grant)
            .map_err(|e| ProtocolError::Room(RoomError::Encrypt(e)))?;
        Ok(Envelope::RoomKey {
            to: to.to_string(),
            from: self.fingerprint().to_string(),
            body,
        })
    }

    /// Send `key` to every pinned member other than ourselves.
    fn distribute(&self, key: &RoomKey) -> Result<Vec<Envelope>> {
        let grant = self.grant_json(key)?;
        let mut envelopes = Vec::new();
        for member in self.room.members()? {
            if member == self.fingerprint() {
                continue;
            }
            match self.trust.get_pinned_public_key(&member)? {
                Some(public) => envelopes.push(self.grant_envelope(&member, &public, &grant)?),
                None => warn!(room = self.room.name(), member = %member, "cannot send room key to unpinned member"),
            }
        }
        Ok(envelopes)
    }

    /// Admit a pending (or any pinned) peer and send it the room key.
    pub fn approve(&self, fingerprint: &str) -> Result<Vec<Envelope>> {
        self.require_owner()?;
        if fingerprint == self.fingerprint() {
            return Err(ProtocolError::InvalidTarget(fingerprint.to_string()));
        }
        self.pinned(fingerprint)?;

        self.room.add_member(fingerprint)?;
        self.room.remove_pending(fingerprint)?;
        let key = self.room.ensure_room_key()?;
        info!(room = self.room.name(), fingerprint, key_id = key.key_id(), "member approved");
        self.emit(EventKind::MemberApproved {
            fingerprint: fingerprint.to_string(),
        });
        self.distribute(&key)
    }

    /// Decline a join request.
    pub fn reject(&self, fingerprint: &str) -> Result<Envelope> {
        self.require_owner()?;
        self.room.remove_pending(fingerprint)?;
        info!(room = self.room.name(), fingerprint, "join request rejected");
        self.emit(EventKind::MemberRejected {
            fingerprint: fingerprint.to_string(),
        });
        Ok(Envelope::JoinReject {
            to: fingerprint.to_string(),
            from: self.fingerprint().to_string(),
        })
    }

    /// Remove a member, rotate the key and hand the new key to everyone
    /// left. The removed peer is not told.
    pub fn kick(&self, fingerprint: &str) -> Result<(String, Vec<Envelope>)> {
        self.require_owner()?;
        if fingerprint == self.fingerprint() {
            return Err(ProtocolError::InvalidTarget(fingerprint.to_string()));
        }
        self.room.remove_member(fingerprint)?;
        self.room.remove_pending(fingerprint)?;
        let key = self.room.rotate_group_key()?;
        info!(room = self.room.name(), fingerprint, key_id = key.key_id(), "member kicked");
        self.emit(EventKind::MemberKicked {
            fingerprint: fingerprint.to_string(),
            key_id: key.key_id().to_string(),
        });
        Ok((key.key_id().to_string(), self.distribute(&key)?))
    }

    /// Rotate the key and hand it to every member.
    pub fn rotate(&self) -> Result<(String, Vec<Envelope>)> {
        self.require_owner()?;
        let key = self.room.rotate_group_key()?;
        self.emit(EventKind::KeyRotated {
            key_id: key.key_id().to_string(),
        });
        Ok((key.key_id().to_string(), self.distribute(&key)?))
    }

    /// Seal a room message.
    pub fn send_group(&self, text: &str) -> Result<Envelope> {
        let sealed = self
            .room
            .encrypt_group(text)?
            .ok_or(ProtocolError::NoGroupKey)?;
        Ok(Envelope::GroupChat {
            from: self.fingerprint().to_string(),
            body: sealed.body,
            key_id: sealed.key_id,
        })
    }

    /// Seal a direct message to a pinned peer.
    pub fn send_direct(&self, to: &str, text: &str) -> Result<Envelope> {
        let public = self.pinned(to)?;
        let body = sealed::seal_direct(self.identity.secret(), &public, text)
            .map_err(|e| ProtocolError::Room(RoomError::Encrypt(e)))?;
        Ok(Envelope::Direct {
            to: to.to_string(),
            from: self.fingerprint().to_string(),
            body,
        })
    }

    /// Current view of the room.
    pub fn snapshot(&self) -> Result<RoomSnapshot> {
        let me = self.fingerprint().to_string();
        let members = self.room.members()?;
        let owner = murmur_room::membership::elect_owner(&members, &me);
        Ok(RoomSnapshot {
            room: self.room.name().to_string(),
            is_owner: owner == me,
            fingerprint: me,
            owner,
            members: members.into_iter().collect(),
            pending: self.room.pending()?.into_iter().collect(),
            key_id: self.room.current_key_id()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use murmur_crypto::fingerprint::fingerprint;
    use murmur_crypto::x25519::X25519StaticSecret;
    use murmur_db::memory::MemoryStore;
    use murmur_db::KvStore;
    use tokio::sync::broadcast;

    struct Peer {
        ctx: RoomContext,
        events: broadcast::Receiver<Event>,
    }

    impl Peer {
        fn new(identity: Identity) -> Self {
            let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
            let bus = EventBus::new(64);
            let events = bus.subscribe();
            let ctx = RoomContext::new(
                Room::new("lobby", store.clone()),
                Arc::new(identity),
                Arc::new(TrustStore::new(store)),
                bus,
            );
            ctx.room().add_member(ctx.fingerprint()).expect("self member");
            Self { ctx, events }
        }

        fn fp(&self) -> String {
            self.ctx.fingerprint().to_string()
        }

        fn deliver(&self, envelopes: Vec<Envelope>) -> Vec<Envelope> {
            envelopes
                .into_iter()
                .flat_map(|e| self.ctx.handle(e).expect("handle").replies)
                .collect()
        }

        fn drain(&mut self) -> Vec<EventKind> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event.kind);
            }
            out
        }
    }

    /// Identities sorted by fingerprint, so the first one is the owner.
    fn identities(n: usize) -> Vec<Identity> {
        let mut ids: Vec<Identity> = (0..n).map(|_| Identity::generate()).collect();
        ids.sort_by(|a, b| a.fingerprint().cmp(b.fingerprint()));
        ids
    }

    fn introduce(a: &Peer, b: &Peer) {
        let acks = b.deliver(vec![a.ctx.handshake()]);
        a.deliver(acks);
    }

    /// Owner with a key plus `n - 1` admitted members.
    fn room_of(n: usize) -> Vec<Peer> {
        let peers: Vec<Peer> = identities(n).into_iter().map(Peer::new).collect();
        peers[0].ctx.room().ensure_room_key().expect("key");
        for joiner in &peers[1..] {
            introduce(joiner, &peers[0]);
            peers[0].deliver(vec![joiner.ctx.join_request()]);
            let grants = peers[0].ctx.approve(&joiner.fp()).expect("approve");
            for peer in &peers[1..] {
                peer.deliver(grants.clone());
            }
        }
        peers
    }

    #[test]
    fn test_handshake_pins_and_acks_once() {
        let ids = identities(2);
        let a = Peer::new(ids[0].clone());
        let b = Peer::new(ids[1].clone());

        let replies = b.deliver(vec![a.ctx.handshake()]);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind(), "hs-ack");
        assert!(a.deliver(replies).is_empty(), "ack is never acked");

        assert!(b.deliver(vec![a.ctx.handshake()]).is_empty(), "no ack for a known contact");
        assert!(a.ctx.trust.get_pinned_public_key(&b.fp()).expect("get").is_some());
        assert!(b.ctx.trust.get_pinned_public_key(&a.fp()).expect("get").is_some());
    }

    #[test]
    fn test_forged_handshake_is_mismatch() {
        let ids = identities(2);
        let a = Peer::new(ids[0].clone());
        let mut b = Peer::new(ids[1].clone());
        b.deliver(vec![a.ctx.handshake()]);

        let forged = Envelope::Handshake {
            fp: a.fp(),
            pk_b64: X25519StaticSecret::random().public_key().to_base64(),
        };
        let err = b.ctx.handle(forged).expect_err("mismatch");
        assert!(matches!(err, ProtocolError::TrustMismatch { .. }));

        b.ctx.report(&err);
        assert!(b.drain().contains(&EventKind::TrustMismatch { fingerprint: a.fp() }));
        assert_eq!(
            b.ctx.trust.get_pinned_public_key(&a.fp()).expect("get"),
            Some(ids[0].public_key().clone())
        );
    }

    #[test]
    fn test_join_approve_chat() {
        let ids = identities(2);
        let mut a = Peer::new(ids[0].clone());
        let mut b = Peer::new(ids[1].clone());
        a.ctx.room().ensure_room_key().expect("key");

        introduce(&b, &a);
        a.deliver(vec![b.ctx.join_request()]);
        assert_eq!(a.ctx.snapshot().expect("snap").pending, vec![b.fp()]);
        assert!(a.drain().contains(&EventKind::JoinRequested { fingerprint: b.fp() }));

        let grants = a.ctx.approve(&b.fp()).expect("approve");
        assert_eq!(grants.len(), 1);
        let outcome = b.ctx.handle(grants[0].clone()).expect("grant");
        assert!(outcome.admitted);

        let sa = a.ctx.snapshot().expect("snap a");
        let sb = b.ctx.snapshot().expect("snap b");
        assert!(sa.pending.is_empty());
        assert_eq!(sa.members, sb.members);
        assert_eq!(sa.key_id, sb.key_id);
        assert_eq!(sb.owner, a.fp());
        assert!(sa.is_owner && !sb.is_owner);

        let msg = a.ctx.send_group("hello").expect("send");
        b.deliver(vec![msg]);
        assert!(b.drain().contains(&EventKind::GroupMessage {
            from: a.fp(),
            text: "hello".into()
        }));
    }

    #[test]
    fn test_non_owner_cannot_manage() {
        let peers = room_of(2);
        let member = &peers[1];
        for result in [
            member.ctx.approve("pk_whoever").map(|_| ()),
            member.ctx.reject("pk_whoever").map(|_| ()),
            member.ctx.kick(&peers[0].fp()).map(|_| ()),
            member.ctx.rotate().map(|_| ()),
        ] {
            assert!(matches!(result, Err(ProtocolError::NotAuthorized { .. })));
        }
    }

    #[test]
    fn test_join_request_ignored_by_non_owner() {
        let peers = room_of(2);
        let outsider = Peer::new(Identity::generate());
        peers[1].deliver(vec![outsider.ctx.join_request()]);
        let snap = peers[1].ctx.snapshot().expect("snap");
        assert!(!snap.is_owner);
        assert!(snap.pending.is_empty());
    }

    #[test]
    fn test_keyless_owner_ignores_join_requests() {
        let ids = identities(2);
        let a = Peer::new(ids[0].clone());
        let b = Peer::new(ids[1].clone());
        a.deliver(vec![b.ctx.join_request()]);
        assert!(a.ctx.snapshot().expect("snap").pending.is_empty());
    }

    #[test]
    fn test_approve_unpinned_changes_nothing() {
        let ids = identities(2);
        let a = Peer::new(ids[0].clone());
        a.ctx.room().ensure_room_key().expect("key");
        let stranger = ids[1].fingerprint().to_string();
        a.ctx.room().add_pending(&stranger).expect("pending");

        assert!(matches!(
            a.ctx.approve(&stranger),
            Err(ProtocolError::UnknownPeer(_))
        ));
        let snap = a.ctx.snapshot().expect("snap");
        assert_eq!(snap.pending, vec![stranger]);
        assert_eq!(snap.members, vec![a.fp()]);
    }

    #[test]
    fn test_reject_flow() {
        let ids = identities(2);
        let a = Peer::new(ids[0].clone());
        let mut b = Peer::new(ids[1].clone());
        a.ctx.room().ensure_room_key().expect("key");
        introduce(&b, &a);
        a.deliver(vec![b.ctx.join_request()]);

        let rejection = a.ctx.reject(&b.fp()).expect("reject");
        assert!(a.ctx.snapshot().expect("snap").pending.is_empty());

        let outcome = b.ctx.handle(rejection).expect("handle");
        assert!(outcome.rejected);
        assert!(b.drain().contains(&EventKind::JoinRejected { by: a.fp() }));
        assert!(!b.ctx.room().has_key().expect("has"));
    }

    #[test]
    fn test_rejection_for_someone_else_ignored() {
        let peers = room_of(2);
        let outcome = peers[1]
            .ctx
            .handle(Envelope::JoinReject {
                to: "pk_someoneelse".into(),
                from: peers[0].fp(),
            })
            .expect("handle");
        assert!(!outcome.rejected);
    }

    #[test]
    fn test_kick_rotates_and_excludes() {
        let peers = room_of(3);
        let (owner, stay, kicked) = (&peers[0], &peers[1], &peers[2]);
        let old_id = owner.ctx.room().current_key_id().expect("id");

        let (new_id, grants) = owner.ctx.kick(&kicked.fp()).expect("kick");
        assert_ne!(Some(new_id.clone()), old_id);
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].recipient(), Some(stay.fp().as_str()));

        stay.deliver(grants.clone());
        kicked.deliver(grants);
        assert_eq!(stay.ctx.room().current_key_id().expect("id"), Some(new_id));
        assert!(!stay.ctx.room().is_member(&kicked.fp()).expect("member"));

        let msg = owner.ctx.send_group("after kick").expect("send");
        assert!(stay.ctx.handle(msg.clone()).is_ok());
        assert!(matches!(
            kicked.ctx.handle(msg),
            Err(ProtocolError::StaleKey { .. })
        ));
    }

    #[test]
    fn test_stale_grant_does_not_restore_kicked_member() {
        let peers = room_of(3);
        let (owner, stay, kicked) = (&peers[0], &peers[1], &peers[2]);
        // A re-grant under the pre-kick key still lists the kicked member.
        let stale = owner.deliver(vec![stay.ctx.join_request()]);
        assert_eq!(stale.len(), 1);

        let (_, grants) = owner.ctx.kick(&kicked.fp()).expect("kick");
        stay.deliver(grants);
        stay.deliver(stale);

        let members = stay.ctx.room().members().expect("members");
        assert!(!members.contains(&kicked.fp()));
        assert!(members.contains(&owner.fp()));
        assert!(members.contains(&stay.fp()));
    }

    #[test]
    fn test_non_owner_grant_keeps_member_set() {
        let peers = room_of(3);
        let (owner, middle, last) = (&peers[0], &peers[1], &peers[2]);
        introduce(middle, last);

        let key = middle
            .ctx
            .room()
            .group_key()
            .expect("key")
            .expect("present");
        let forged = key
            .to_grant(Some(vec![middle.fp(), last.fp()]))
            .to_json()
            .expect("json");
        let envelope = middle
            .ctx
            .grant_envelope(&last.fp(), last.ctx.identity.public_key(), &forged)
            .expect("seal");
        last.deliver(vec![envelope]);

        assert!(last.ctx.room().is_member(&owner.fp()).expect("member"));
        assert_eq!(last.ctx.snapshot().expect("snap").owner, owner.fp());
    }

    #[test]
    fn test_grant_member_list_reaches_joiner_that_sorts_first() {
        let mut ids = identities(3).into_iter();
        let (first, owner, member) = match (ids.next(), ids.next(), ids.next()) {
            (Some(a), Some(b), Some(c)) => (Peer::new(a), Peer::new(b), Peer::new(c)),
            _ => unreachable!("three identities"),
        };
        owner.ctx.room().ensure_room_key().expect("key");
        introduce(&member, &owner);
        member.deliver(owner.ctx.approve(&member.fp()).expect("approve member"));

        introduce(&first, &owner);
        let grants = owner.ctx.approve(&first.fp()).expect("approve first");
        member.deliver(grants.clone());
        first.deliver(grants);

        let expected: Vec<String> = {
            let mut all = vec![first.fp(), owner.fp(), member.fp()];
            all.sort();
            all
        };
        for peer in [&first, &owner, &member] {
            let members: Vec<String> = peer.ctx.room().members().expect("members").into_iter().collect();
            assert_eq!(members, expected);
        }
        assert!(first.ctx.room().is_owner(&first.fp()).expect("owner"));
    }

    #[test]
    fn test_rotate_redistributes() {
        let peers = room_of(3);
        let (new_id, grants) = peers[0].ctx.rotate().expect("rotate");
        assert_eq!(grants.len(), 2);
        for peer in &peers[1..] {
            peer.deliver(grants.clone());
            assert_eq!(
                peer.ctx.room().current_key_id().expect("id").as_deref(),
                Some(new_id.as_str())
            );
        }
    }

    #[test]
    fn test_member_join_request_regrants() {
        let peers = room_of(2);
        let regrant = peers[0].deliver(vec![peers[1].ctx.join_request()]);
        assert_eq!(regrant.len(), 1);
        assert_eq!(regrant[0].kind(), "room-key");
        assert!(peers[0].ctx.snapshot().expect("snap").pending.is_empty());
    }

    #[test]
    fn test_send_without_key() {
        let peer = Peer::new(Identity::generate());
        assert!(matches!(
            peer.ctx.send_group("hi"),
            Err(ProtocolError::NoGroupKey)
        ));
    }

    #[test]
    fn test_group_message_before_key_is_stale() {
        let peers = room_of(2);
        let outsider = Peer::new(Identity::generate());
        let msg = peers[0].ctx.send_group("hi").expect("send");
        assert!(matches!(
            outsider.ctx.handle(msg),
            Err(ProtocolError::StaleKey { current: None, .. })
        ));
    }

    #[test]
    fn test_direct_messages() {
        let ids = identities(3);
        let a = Peer::new(ids[0].clone());
        let mut b = Peer::new(ids[1].clone());
        let c = Peer::new(ids[2].clone());
        introduce(&a, &b);

        let dm = a.ctx.send_direct(&b.fp(), "psst").expect("send");
        b.deliver(vec![dm.clone()]);
        assert!(b.drain().contains(&EventKind::DirectMessage {
            from: a.fp(),
            text: "psst".into()
        }));

        // Not addressed to c, so ignored rather than failing.
        assert!(c.ctx.handle(dm).expect("handle").replies.is_empty());

        assert!(matches!(
            a.ctx.send_direct(&c.fp(), "hello"),
            Err(ProtocolError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_direct_from_unpinned_dropped() {
        let ids = identities(2);
        let a = Peer::new(ids[0].clone());
        let b = Peer::new(ids[1].clone());
        let body = sealed::seal_direct(ids[0].secret(), ids[1].public_key(), "x").expect("seal");
        let dm = Envelope::Direct {
            to: b.fp(),
            from: a.fp(),
            body,
        };
        assert!(matches!(b.ctx.handle(dm), Err(ProtocolError::UnknownPeer(_))));
    }

    #[test]
    fn test_tampered_grant_is_decrypt_failure() {
        let ids = identities(2);
        let a = Peer::new(ids[0].clone());
        let b = Peer::new(ids[1].clone());
        a.ctx.room().ensure_room_key().expect("key");
        introduce(&b, &a);

        let mut grants = a.ctx.approve(&b.fp()).expect("approve");
        let Some(Envelope::RoomKey { body, .. }) = grants.first_mut() else {
            unreachable!("approve yields a room-key envelope");
        };
        let mut sealed_body: serde_json::Value = serde_json::from_str(body).expect("json");
        sealed_body["n"] = serde_json::Value::String(murmur_crypto::encoding::b64_encode(&[0u8; 24]));
        *body = sealed_body.to_string();

        assert!(matches!(
            b.ctx.handle(grants.remove(0)),
            Err(ProtocolError::DecryptFailure { .. })
        ));
        assert!(!b.ctx.room().has_key().expect("has"));
    }

    #[test]
    fn test_malformed_bytes() {
        let peer = Peer::new(Identity::generate());
        assert!(matches!(
            peer.ctx.handle_bytes(b"{\"type\":\"nope\"}"),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            peer.ctx.handle(Envelope::Handshake {
                fp: "pk_x".into(),
                pk_b64: "!!".into()
            }),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_own_envelopes_ignored() {
        let peer = Peer::new(Identity::generate());
        let outcome = peer.ctx.handle(peer.ctx.handshake()).expect("handle");
        assert!(outcome.replies.is_empty());
        assert!(peer.ctx.trust.list_contacts().expect("list").is_empty());
    }

    #[test]
    fn test_fingerprint_matches_identity() {
        let identity = Identity::generate();
        assert_eq!(identity.fingerprint(), fingerprint(identity.public_key()));
    }
}
