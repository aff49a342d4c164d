//! Integration test: convergence under loss, reordering and late arrival.
//!
//! The hub filter drops or holds chosen envelopes; rebroadcast, peer
//! re-announcement and re-grants have to bring every peer to the same
//! member set and key anyway.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use murmur_integration_tests::{
    admitted_room, envelope_kind, fast_config, peers, wait_for_snapshot, Peer, ROOM,
};
use murmur_node::{EventKind, RoomMode};
use murmur_transport::memory::{MemoryHub, ReleaseOrder, Verdict};

#[tokio::test]
async fn test_rebroadcast_heals_dropped_join_requests() {
    let hub = MemoryHub::new();
    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = dropped.clone();
    hub.set_filter(move |delivery| {
        if envelope_kind(delivery.data) == Some("join-req") && counter.fetch_add(1, Ordering::SeqCst) < 3 {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    })
    .expect("filter");

    let mut peers = peers(&hub, 2, &fast_config());
    let rooms = admitted_room(&mut peers).await;

    assert!(dropped.load(Ordering::SeqCst) >= 3);
    assert!(hub.stats().expect("stats").dropped >= 3);
    let owner_key = rooms[0].snapshot().await.expect("snapshot").key_id;
    wait_for_snapshot(&rooms[1], "same key", |s| s.key_id == owner_key).await;
}

#[tokio::test]
async fn test_lost_grant_is_resent() {
    let hub = MemoryHub::new();
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();
    hub.set_filter(move |delivery| {
        if envelope_kind(delivery.data) == Some("room-key") && !flag.swap(true, Ordering::SeqCst) {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    })
    .expect("filter");

    // The joiner stays keyless, keeps asking, and the owner re-grants to
    // an existing member.
    let mut peers = peers(&hub, 2, &fast_config());
    let rooms = admitted_room(&mut peers).await;

    assert!(dropped.load(Ordering::SeqCst));
    let owner_view = rooms[0].snapshot().await.expect("snapshot");
    let member_view = rooms[1].snapshot().await.expect("snapshot");
    assert_eq!(owner_view.members, member_view.members);
    assert_eq!(owner_view.key_id, member_view.key_id);
}

#[tokio::test]
async fn test_reordered_bootstrap_converges() {
    let hub = MemoryHub::new();
    let mut peers = peers(&hub, 2, &fast_config());
    let b = peers[1].fp();

    let owner_room = peers[0].node.open_room(ROOM, RoomMode::Create).await.expect("create");

    let joiner_id = peers[1].peer_id.clone();
    hub.set_filter(move |delivery| {
        if delivery.from == joiner_id {
            Verdict::Hold
        } else {
            Verdict::Deliver
        }
    })
    .expect("filter");
    let joiner_room = peers[1].node.open_room(ROOM, RoomMode::Join).await.expect("join");
    tokio::time::sleep(Duration::from_millis(120)).await;

    // Join requests now reach the owner before the handshake that pins
    // their sender.
    hub.clear_filter().expect("clear");
    let released = hub.release_held(ReleaseOrder::Reversed).expect("release");
    assert!(released >= 2);

    peers[0]
        .wait_for("join request", |k| {
            matches!(k, EventKind::JoinRequested { fingerprint } if *fingerprint == b)
        })
        .await;
    owner_room.approve(&b).await.expect("approve");
    peers[1]
        .wait_for("admission", |k| matches!(k, EventKind::Admitted { .. }))
        .await;

    let owner_key = owner_room.snapshot().await.expect("snapshot").key_id;
    assert_eq!(joiner_room.snapshot().await.expect("snapshot").key_id, owner_key);
}

#[tokio::test]
async fn test_late_owner_receives_rebroadcast() {
    let hub = MemoryHub::new();
    let mut peers = peers(&hub, 2, &fast_config());
    let b = peers[1].fp();

    let joiner_room = peers[1].node.open_room(ROOM, RoomMode::Join).await.expect("join");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let owner_room = peers[0].node.open_room(ROOM, RoomMode::Create).await.expect("create");

    peers[0]
        .wait_for("join request", |k| {
            matches!(k, EventKind::JoinRequested { fingerprint } if *fingerprint == b)
        })
        .await;
    owner_room.approve(&b).await.expect("approve");
    let owner_key = owner_room.snapshot().await.expect("snapshot").key_id;
    wait_for_snapshot(&joiner_room, "admission", |s| s.key_id == owner_key).await;
}

#[tokio::test]
async fn test_peer_connected_reannounces() {
    let hub = MemoryHub::new();
    // Long enough that the timer never fires during the test.
    let mut config = fast_config();
    config.protocol.rebroadcast_interval_ms = 60_000;

    let block = Arc::new(AtomicBool::new(true));
    let blocking = block.clone();
    hub.set_filter(move |delivery| {
        if blocking.load(Ordering::SeqCst) && envelope_kind(delivery.data) == Some("join-req") {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    })
    .expect("filter");

    let mut peers = peers(&hub, 2, &config);
    let b = peers[1].fp();
    let _owner_room = peers[0].node.open_room(ROOM, RoomMode::Create).await.expect("create");
    let _joiner_room = peers[1].node.open_room(ROOM, RoomMode::Join).await.expect("join");
    peers[0]
        .wait_for("handshake", |k| {
            matches!(k, EventKind::ContactPinned { fingerprint } if *fingerprint == b)
        })
        .await;

    block.store(false, Ordering::SeqCst);
    hub.announce(&peers[0].peer_id).expect("announce");
    peers[0]
        .wait_for("join request after reconnect", |k| {
            matches!(k, EventKind::JoinRequested { fingerprint } if *fingerprint == b)
        })
        .await;
}

#[tokio::test]
async fn test_restart_resumes_with_stored_key() {
    let hub = MemoryHub::new();
    let mut peers = peers(&hub, 2, &fast_config());
    let rooms = admitted_room(&mut peers).await;
    let a = peers[0].fp();
    let key_id = rooms[0].snapshot().await.expect("snapshot").key_id;

    let old = peers.pop().expect("joiner");
    old.node.shutdown();
    hub.disconnect(&old.peer_id).expect("disconnect");

    let mut restarted = Peer::start(&hub, old.store.clone(), fast_config());
    assert_eq!(restarted.fp(), old.fp());
    let room = restarted.node.open_room(ROOM, RoomMode::Join).await.expect("rejoin");
    let view = room.snapshot().await.expect("snapshot");
    assert_eq!(view.key_id, key_id);
    assert_eq!(view.owner, a);

    rooms[0].send("welcome back").await.expect("send");
    restarted
        .wait_for("message after restart", |k| {
            matches!(k, EventKind::GroupMessage { text, .. } if text == "welcome back")
        })
        .await;
}
