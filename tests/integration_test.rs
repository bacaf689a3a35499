// Integration tests for the SFU room server
// These drive an in-process server: signaling connections through channels,
// and the warp routes on an ephemeral port

mod common;

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use common::*;
use sfu_rooms::client::ClientReconciler;
use sfu_rooms::error::ErrorKind;
use sfu_rooms::media::{LocalMediaEngine, MediaEngine, MediaKind, TransportDirection};
use sfu_rooms::recording::RecordingStatus;
use sfu_rooms::sfu::{EngineHealth, SfuEvent, SfuRequest, SfuServer};

struct Harness {
    server: Arc<SfuServer>,
    engine: Arc<LocalMediaEngine>,
    transcoder: Arc<FakeTranscoder>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let engine = Arc::new(LocalMediaEngine::new(config.media.clone()));
    let transcoder = Arc::new(FakeTranscoder::default());
    let server = SfuServer::new(config, engine.clone(), transcoder.clone());
    Harness {
        server,
        engine,
        transcoder,
        _dir: dir,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Test the full two-peer flow
/// join, produce, consume, resume, disconnect
#[tokio::test]
async fn test_two_peer_media_flow() {
    let h = harness();
    let mut alice = TestPeer::connect(&h.server);
    let mut bob = TestPeer::connect(&h.server);

    match alice.join("r", "alice").await {
        SfuEvent::Joined { peer_id, peers, is_recording, .. } => {
            assert_eq!(peer_id, alice.id());
            assert!(peers.is_empty());
            assert!(!is_recording);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let bob_joined = bob.join("r", "bob").await;
    match &bob_joined {
        SfuEvent::Joined { peers, .. } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].peer_id, alice.id());
            assert_eq!(peers[0].peer_name, "alice");
        }
        other => panic!("unexpected event {:?}", other),
    }
    match alice.next().await {
        SfuEvent::PeerJoined { peer_id, peer_name } => {
            assert_eq!(peer_id, bob.id());
            assert_eq!(peer_name, "bob");
        }
        other => panic!("unexpected event {:?}", other),
    }

    let send = alice.transport(TransportDirection::Send).await;
    let producer_id = alice.produce_video(&send).await;
    match bob.next().await {
        SfuEvent::NewProducer { peer_id, producer_id: p, kind } => {
            assert_eq!(peer_id, alice.id());
            assert_eq!(p, producer_id);
            assert_eq!(kind, MediaKind::Video);
        }
        other => panic!("unexpected event {:?}", other),
    }

    bob.transport(TransportDirection::Recv).await;
    bob.request(SfuRequest::Consume {
        producer_id: producer_id.clone(),
        rtp_capabilities: capabilities_of(&bob_joined),
    })
    .await;
    let consumer_id = match bob.next().await {
        SfuEvent::Consumed { consumer_id, producer_id: p, kind, paused, .. } => {
            assert_eq!(p, producer_id);
            assert_eq!(kind, MediaKind::Video);
            assert!(paused);
            consumer_id
        }
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(h.engine.is_consumer_paused(&consumer_id), Some(true));

    bob.request(SfuRequest::ResumeConsumer { consumer_id: consumer_id.clone() }).await;
    assert!(matches!(bob.next().await, SfuEvent::ConsumerResumed { consumer_id: c } if c == consumer_id));
    assert_eq!(h.engine.is_consumer_paused(&consumer_id), Some(false));

    alice.connection.disconnect().await;
    let left = bob
        .until(|e| matches!(e, SfuEvent::PeerLeft { .. }))
        .await;
    assert!(matches!(left, SfuEvent::PeerLeft { peer_id } if peer_id == alice.id()));
    assert_eq!(h.engine.is_consumer_paused(&consumer_id), None);

    bob.connection.disconnect().await;
    assert_eq!(h.server.registry().room_count(), 0);
    assert!(h.server.registry().lookup_by_name("r").is_none());
    assert_eq!(h.engine.counts(), Default::default());
}

/// Test that the room lives exactly as long as it has peers
#[tokio::test]
async fn test_room_lifetime_follows_peer_count() {
    let h = harness();
    let mut peers: Vec<TestPeer> = (0..4).map(|_| TestPeer::connect(&h.server)).collect();

    for (i, peer) in peers.iter_mut().enumerate() {
        peer.join("lobby", &format!("peer-{}", i)).await;
    }
    let room = h.server.registry().lookup_by_name("lobby").unwrap();
    assert_eq!(room.lock().await.peers.len(), 4);

    for (left, peer) in peers.iter().enumerate().take(3) {
        peer.connection.disconnect().await;
        assert_eq!(room.lock().await.peers.len(), 3 - left);
        assert_eq!(h.server.registry().room_count(), 1);
    }

    peers[3].request(SfuRequest::Leave).await;
    assert_eq!(h.server.registry().room_count(), 0);
    assert!(room.is_closed());
    assert_eq!(h.engine.counts().routers, 0);
}

/// Test that concurrent joins of a new name share one room
#[tokio::test]
async fn test_concurrent_joins_share_room() {
    let h = harness();
    let mut peers: Vec<TestPeer> = (0..8).map(|_| TestPeer::connect(&h.server)).collect();

    let joins = peers.iter().enumerate().map(|(i, peer)| {
        let connection = peer.connection.clone();
        async move {
            connection
                .handle_request(SfuRequest::Join {
                    room_name: "busy".to_string(),
                    peer_name: format!("p{}", i),
                })
                .await
        }
    });
    futures::future::join_all(joins).await;

    assert_eq!(h.server.registry().room_count(), 1);
    assert_eq!(h.engine.counts().routers, 1);
    for peer in peers.iter_mut() {
        assert!(matches!(peer.next().await, SfuEvent::Joined { .. }));
    }
}

/// Test that a peer cannot consume its own producer
#[tokio::test]
async fn test_self_consumption_rejected() {
    let h = harness();
    let mut alice = TestPeer::connect(&h.server);
    let joined = alice.join("r", "alice").await;

    let send = alice.transport(TransportDirection::Send).await;
    alice.transport(TransportDirection::Recv).await;
    let producer_id = alice.produce_video(&send).await;

    alice
        .request(SfuRequest::Consume {
            producer_id,
            rtp_capabilities: capabilities_of(&joined),
        })
        .await;
    match alice.next().await {
        SfuEvent::Error { code, message } => {
            assert_eq!(code, ErrorKind::Validation);
            assert!(message.contains("own producer"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.engine.counts().consumers, 0);
}

/// Test that a consume with incompatible capabilities is a capability error
#[tokio::test]
async fn test_incompatible_capabilities_rejected() {
    let h = harness();
    let mut alice = TestPeer::connect(&h.server);
    let mut bob = TestPeer::connect(&h.server);
    alice.join("r", "alice").await;
    bob.join("r", "bob").await;
    alice.drain();

    let send = alice.transport(TransportDirection::Send).await;
    let producer_id = alice.produce_video(&send).await;
    bob.transport(TransportDirection::Recv).await;
    bob.drain();

    bob.request(SfuRequest::Consume {
        producer_id,
        rtp_capabilities: Default::default(),
    })
    .await;
    assert!(matches!(
        bob.next().await,
        SfuEvent::Error { code: ErrorKind::Capability, .. }
    ));
}

/// Test recording lifecycle as seen by every peer in the room
#[tokio::test]
async fn test_recording_lifecycle() {
    let h = harness();
    let mut alice = TestPeer::connect(&h.server);
    let mut bob = TestPeer::connect(&h.server);
    alice.join("studio", "alice").await;
    bob.join("studio", "bob").await;
    let send = alice.transport(TransportDirection::Send).await;
    alice.produce_video(&send).await;
    alice.drain();
    bob.drain();

    alice.request(SfuRequest::StartRecording).await;
    let mut started = Vec::new();
    for peer in [&mut alice, &mut bob] {
        match peer.until(|e| matches!(e, SfuEvent::RecordingStarted { .. })).await {
            SfuEvent::RecordingStarted { recording_id, start_time } => {
                assert!(start_time <= chrono::Utc::now());
                started.push((recording_id, start_time));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(started[0], started[1]);
    let (recording_id, start_time) = started[0].clone();

    bob.request(SfuRequest::StartRecording).await;
    match bob.next().await {
        SfuEvent::Error { code, .. } => assert_eq!(code, ErrorKind::Conflict),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.transcoder.starts(), 1);

    // a late joiner learns which recording is running
    let mut carol = TestPeer::connect(&h.server);
    match carol.join("studio", "carol").await {
        SfuEvent::Joined { is_recording, recording_id: running, .. } => {
            assert!(is_recording);
            assert_eq!(running.as_deref(), Some(recording_id.as_str()));
        }
        other => panic!("unexpected event {:?}", other),
    }
    carol.connection.disconnect().await;

    bob.request(SfuRequest::StopRecording { recording_id: recording_id.clone() }).await;
    for peer in [&mut alice, &mut bob] {
        match peer.until(|e| matches!(e, SfuEvent::RecordingStopped { .. })).await {
            SfuEvent::RecordingStopped { recording_id: id, end_time, file_path } => {
                assert_eq!(id, recording_id);
                assert!(end_time >= start_time);
                assert!(!file_path.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    let recordings = h.server.recordings().clone();
    wait_for("completed recording", || {
        recordings.get(&recording_id).map(|s| s.status) == Some(RecordingStatus::Completed)
    })
    .await;

    // stopping again leaves the stored status alone
    bob.request(SfuRequest::StopRecording { recording_id: recording_id.clone() }).await;
    assert!(matches!(bob.next().await, SfuEvent::Error { .. }));
    assert_eq!(
        recordings.get(&recording_id).map(|s| s.status),
        Some(RecordingStatus::Completed)
    );

    bob.request(SfuRequest::GetRecordings).await;
    match bob.next().await {
        SfuEvent::Recordings { recordings } => {
            assert_eq!(recordings.len(), 1);
            assert_eq!(recordings[0].id, recording_id);
            assert_eq!(recordings[0].file_size, Some(10));
        }
        other => panic!("unexpected event {:?}", other),
    }

    bob.request(SfuRequest::DeleteRecording { recording_id: recording_id.clone() }).await;
    assert!(matches!(bob.next().await, SfuEvent::RecordingDeleted { recording_id: id } if id == recording_id));
    assert!(recordings.get(&recording_id).is_none());
}

/// Test that an engine worker failure tears down its rooms and recovers
#[tokio::test]
async fn test_engine_failure_supervision() {
    let h = harness();
    let supervisor = h.server.spawn_supervisor();
    let mut health = h.server.subscribe_health();

    let mut alice = TestPeer::connect(&h.server);
    let mut bob = TestPeer::connect(&h.server);
    alice.join("doomed", "alice").await;
    bob.join("doomed", "bob").await;
    alice.request(SfuRequest::StartRecording).await;
    alice.until(|e| matches!(e, SfuEvent::RecordingStarted { .. })).await;
    let recording = h.server.recordings().list_all().pop().unwrap();

    h.engine.kill_worker(0, "segfault");

    for peer in [&mut alice, &mut bob] {
        match peer.until(|e| matches!(e, SfuEvent::RoomClosed { .. })).await {
            SfuEvent::RoomClosed { reason, .. } => assert!(reason.contains("segfault")),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(h.server.registry().room_count(), 0);

    let recordings = h.server.recordings().clone();
    wait_for("failed recording", || {
        recordings.get(&recording.id).map(|s| s.status) == Some(RecordingStatus::Failed)
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), health.wait_for(|state| *state == EngineHealth::Healthy))
        .await
        .unwrap()
        .unwrap();

    // the connection is free to join again once its room is gone
    match alice.join("doomed", "alice").await {
        SfuEvent::Joined { peers, .. } => assert!(peers.is_empty()),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.server.registry().room_count(), 1);

    supervisor.abort();
}

/// Test that a peer who leaves and rejoins shows up again in other views
#[tokio::test]
async fn test_rejoined_peer_visible_to_others() {
    let h = harness();
    let mut alice = TestPeer::connect(&h.server);
    let mut bob = TestPeer::connect(&h.server);

    let mut view = ClientReconciler::new();
    view.apply_event(&bob.join("r", "bob").await);

    alice.join("r", "alice").await;
    let first_id = alice.id();
    alice.request(SfuRequest::Leave).await;
    alice.until(|e| matches!(e, SfuEvent::Left { .. })).await;

    alice.join("r", "alice").await;
    let second_id = alice.id();
    assert_ne!(second_id, first_id);
    let send = alice.transport(TransportDirection::Send).await;
    let producer_id = alice.produce_video(&send).await;

    loop {
        let event = bob.next().await;
        view.apply_event(&event);
        if matches!(&event, SfuEvent::NewProducer { producer_id: p, .. } if *p == producer_id) {
            break;
        }
    }

    let participants: Vec<&str> = view.participants().iter().map(|p| p.peer_id.as_str()).collect();
    assert_eq!(participants, vec![second_id.as_str()]);
    assert_eq!(view.streams_of(&second_id).len(), 1);
    assert!(view.streams_of(&first_id).is_empty());

    let room = h.server.registry().lookup_by_name("r").unwrap();
    assert_eq!(room.lock().await.peers.len(), 2);
}

/// Test that a stalled capability check times out instead of blocking the connection
#[tokio::test]
async fn test_stalled_can_consume_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.media.operation_timeout = Duration::from_millis(200);
    let engine = Arc::new(SlowEngine {
        inner: LocalMediaEngine::new(config.media.clone()),
        produce_delay: Duration::ZERO,
        can_consume_delay: Duration::from_secs(3600),
    });
    let server = SfuServer::new(config, engine.clone(), Arc::new(FakeTranscoder::default()));

    let mut alice = TestPeer::connect(&server);
    let mut bob = TestPeer::connect(&server);
    alice.join("r", "alice").await;
    let bob_joined = bob.join("r", "bob").await;
    let send = alice.transport(TransportDirection::Send).await;
    let producer_id = alice.produce_video(&send).await;
    bob.transport(TransportDirection::Recv).await;

    let consume = bob.request(SfuRequest::Consume {
        producer_id,
        rtp_capabilities: capabilities_of(&bob_joined),
    });
    tokio::time::timeout(Duration::from_secs(3), consume)
        .await
        .expect("consume should give up after the engine timeout");
    match bob.reply(|e| matches!(e, SfuEvent::Consumed { .. })).await {
        SfuEvent::Error { code, .. } => assert_eq!(code, ErrorKind::Resource),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(engine.inner.counts().consumers, 0);

    // the connection keeps serving requests
    bob.request(SfuRequest::GetRoomStats).await;
    assert!(matches!(
        bob.reply(|e| matches!(e, SfuEvent::RoomStats(_))).await,
        SfuEvent::RoomStats(_)
    ));
}

/// Test that a produce completing after disconnect is discarded
#[tokio::test]
async fn test_disconnect_during_produce() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let engine = Arc::new(SlowEngine {
        inner: LocalMediaEngine::new(config.media.clone()),
        produce_delay: Duration::from_millis(300),
        can_consume_delay: Duration::ZERO,
    });
    let server = SfuServer::new(config, engine.clone(), Arc::new(FakeTranscoder::default()));

    let mut alice = TestPeer::connect(&server);
    alice.join("r", "alice").await;
    let send = alice.transport(TransportDirection::Send).await;

    let connection = alice.connection.clone();
    let produce = tokio::spawn(async move {
        connection
            .handle_request(SfuRequest::Produce {
                transport_id: send,
                kind: MediaKind::Video,
                rtp_parameters: vp8_params(),
            })
            .await
    });

    sleep(Duration::from_millis(50)).await;
    alice.connection.disconnect().await;
    produce.await.unwrap();

    assert_eq!(server.registry().room_count(), 0);
    assert_eq!(engine.inner.counts(), Default::default());
    while let Ok(event) = alice.events.try_recv() {
        assert!(!matches!(event, SfuEvent::Produced { .. }), "produce should not succeed");
    }
}

/// Test WebSocket signaling and HTTP endpoints on a real listener
#[tokio::test]
async fn test_websocket_and_http_surface() {
    let h = harness();
    let (addr, _server) = sfu_rooms::api::bind_ephemeral(h.server.clone());
    let http = reqwest::Client::new();

    let health: serde_json::Value = http
        .get(format!("http://{}/sfu/health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["rooms"], 0);

    let config: serde_json::Value = http
        .get(format!("http://{}/sfu/config", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(config["routerRtpCapabilities"]["codecs"].as_array().unwrap().len() >= 2);

    let (ws, _) = connect_async(format!("ws://{}/sfu", addr)).await.unwrap();
    let (mut write, mut read) = ws.split();
    write
        .send(Message::Text(
            r#"{"type":"join","roomName":"wire","peerName":"ws-peer"}"#.to_string(),
        ))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), read.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["type"], "joined");
    assert!(reply["peerId"].as_str().is_some());
    assert_eq!(reply["isRecording"], false);

    write.send(Message::Text("garbage".to_string())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), read.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "validation");

    assert_eq!(h.server.registry().room_count(), 1);
    write.send(Message::Close(None)).await.unwrap();
    drop(write);
    drop(read);

    let server = h.server.clone();
    wait_for("room teardown after close", move || server.registry().room_count() == 0).await;

    let missing = http
        .get(format!("http://{}/sfu/recordings/nope/download", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let listing: serde_json::Value = http
        .get(format!("http://{}/sfu/recordings", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listing["recordings"].as_array().unwrap().is_empty());
}

/// Test recording download and deletion over HTTP
#[tokio::test]
async fn test_recording_download_and_delete() {
    let h = harness();
    let (addr, _server) = sfu_rooms::api::bind_ephemeral(h.server.clone());

    let mut alice = TestPeer::connect(&h.server);
    alice.join("archive", "alice").await;
    alice.request(SfuRequest::StartRecording).await;
    let recording_id = match alice.until(|e| matches!(e, SfuEvent::RecordingStarted { .. })).await {
        SfuEvent::RecordingStarted { recording_id, .. } => recording_id,
        other => panic!("unexpected event {:?}", other),
    };
    alice.request(SfuRequest::StopRecording { recording_id: recording_id.clone() }).await;

    let recordings = h.server.recordings().clone();
    wait_for("completed recording", || {
        recordings.get(&recording_id).map(|s| s.status) == Some(RecordingStatus::Completed)
    })
    .await;
    let file_path = recordings.get(&recording_id).unwrap().file_path;

    let http = reqwest::Client::new();
    let download = http
        .get(format!("http://{}/sfu/recordings/{}/download", addr, recording_id))
        .send()
        .await
        .unwrap();
    assert_eq!(download.status(), 200);
    assert_eq!(download.bytes().await.unwrap().as_ref(), b"webm-bytes");

    let deleted = http
        .delete(format!("http://{}/sfu/recordings/{}", addr, recording_id))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
    assert!(!std::path::Path::new(&file_path).exists());

    let again = http
        .delete(format!("http://{}/sfu/recordings/{}", addr, recording_id))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 404);
}

/// Engine trait objects are usable from the public API
#[test]
fn test_engine_is_object_safe() {
    let engine: Arc<dyn MediaEngine> = Arc::new(LocalMediaEngine::new(Default::default()));
    drop(engine);
}
