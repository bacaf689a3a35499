use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use uuid::Uuid;

use super::peer::{EventSender, PeerSession};
use super::signaling::{PeerSummary, SfuEvent};
use crate::error::{Result, SfuError};
use crate::media::{with_timeout, MediaEngine, MediaHandle, RouterHandle, RtpCapabilities};

/// Per-room recording reservation. Present from the moment a start is
/// accepted; `active` flips once the transcoder confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecording {
    pub id: String,
    pub active: bool,
}

/// Mutable room state, only reachable through [`Room::lock`].
#[derive(Debug, Default)]
pub struct RoomState {
    pub peers: HashMap<String, PeerSession>,
    pub recording: Option<RoomRecording>,
}

impl RoomState {
    pub fn peer(&self, peer_id: &str) -> Result<&PeerSession> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))
    }

    pub fn peer_mut(&mut self, peer_id: &str) -> Result<&mut PeerSession> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))
    }

    /// Sends `event` to every peer except `except`.
    pub fn broadcast(&self, event: &SfuEvent, except: Option<&str>) {
        for peer in self.peers.values() {
            if Some(peer.id.as_str()) != except {
                peer.send(event.clone());
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active_recording().is_some()
    }

    pub fn active_recording(&self) -> Option<&str> {
        self.recording
            .as_ref()
            .filter(|r| r.active)
            .map(|r| r.id.as_str())
    }
}

pub struct Room {
    pub id: String,
    pub name: String,
    pub router: RouterHandle,
    pub rtp_capabilities: RtpCapabilities,
    pub created_at: DateTime<Utc>,
    closed: AtomicBool,
    state: Mutex<RoomState>,
}

impl Room {
    /// Enters the room's critical section.
    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    /// Once set the room accepts no new peers; only flipped under the room lock.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("router", &self.router.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Result of removing a peer.
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    pub removed: bool,
    pub room_closed: bool,
    /// Recording reservation released by the room teardown.
    pub recording: Option<RoomRecording>,
}

#[derive(Default)]
struct RoomSlot {
    room: OnceCell<Arc<Room>>,
}

impl RoomSlot {
    fn is_stale(&self) -> bool {
        self.room.get().map(|room| room.is_closed()).unwrap_or(false)
    }
}

/// Owns every live room.
///
/// Name lookups go through a slot per name so that concurrent first joins on
/// the same name share a single routing context allocation.
pub struct RoomRegistry {
    engine: Arc<dyn MediaEngine>,
    timeout: Duration,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    names: SyncMutex<HashMap<String, Arc<RoomSlot>>>,
}

impl RoomRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, timeout: Duration) -> Self {
        Self {
            engine,
            timeout,
            rooms: RwLock::new(HashMap::new()),
            names: SyncMutex::new(HashMap::new()),
        }
    }

    /// Returns the live room called `name`, creating it on first use.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Room>> {
        let slot = {
            let mut names = self.names.lock();
            match names.get(name) {
                Some(slot) if !slot.is_stale() => slot.clone(),
                _ => {
                    let slot = Arc::new(RoomSlot::default());
                    names.insert(name.to_string(), slot.clone());
                    slot
                }
            }
        };

        let result = slot
            .room
            .get_or_try_init(|| self.create_room(name, &slot))
            .await
            .cloned();

        if result.is_err() {
            let mut names = self.names.lock();
            let owned = names
                .get(name)
                .map(|current| Arc::ptr_eq(current, &slot))
                .unwrap_or(false);
            if owned && !slot.room.initialized() {
                names.remove(name);
            }
        }
        result
    }

    async fn create_room(&self, name: &str, slot: &Arc<RoomSlot>) -> Result<Arc<Room>> {
        let router = with_timeout(self.timeout, "createRouter", self.engine.create_router()).await?;
        let rtp_capabilities = match self.engine.rtp_capabilities(&router) {
            Ok(capabilities) => capabilities,
            Err(e) => {
                self.engine.close(MediaHandle::Router(router.id.clone())).await;
                return Err(e);
            }
        };

        let room = Arc::new(Room {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            router,
            rtp_capabilities,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            state: Mutex::new(RoomState::default()),
        });

        self.rooms.write().insert(room.id.clone(), room.clone());
        // A failed concurrent attempt may have dropped the slot in the meantime.
        self.names
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| slot.clone());

        tracing::info!(
            room_id = %room.id,
            room_name = %room.name,
            router_id = %room.router.id,
            worker_id = room.router.worker_id,
            "Room created"
        );
        Ok(room)
    }

    /// Adds a peer to the room and delivers `joined` to it, then announces it
    /// to everyone already present. Both happen inside the room's critical
    /// section, so the joiner's own identity is queued before any broadcast
    /// naming it.
    pub async fn admit(
        &self,
        room_id: &str,
        peer_id: &str,
        peer_name: &str,
        sender: EventSender,
    ) -> Result<Arc<Room>> {
        let room = self
            .lookup_by_id(room_id)
            .ok_or_else(|| SfuError::RoomNotFound(room_id.to_string()))?;

        let mut state = room.lock().await;
        if room.is_closed() {
            return Err(SfuError::RoomClosed(room.id.clone()));
        }
        if state.peers.contains_key(peer_id) {
            return Err(SfuError::PeerAlreadyExists(peer_id.to_string()));
        }

        let mut peers: Vec<PeerSummary> = state.peers.values().map(|p| p.summary()).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let session = PeerSession::new(peer_id.to_string(), peer_name.to_string(), sender);
        session.send(SfuEvent::Joined {
            peer_id: peer_id.to_string(),
            room_id: room.id.clone(),
            router_rtp_capabilities: room.rtp_capabilities.clone(),
            is_recording: state.is_recording(),
            recording_id: state.active_recording().map(str::to_string),
            peers,
        });
        state.broadcast(
            &SfuEvent::PeerJoined {
                peer_id: peer_id.to_string(),
                peer_name: peer_name.to_string(),
            },
            None,
        );
        state.peers.insert(peer_id.to_string(), session);

        tracing::info!(
            room_id = %room.id,
            peer_id = %peer_id,
            peer_name = %peer_name,
            peer_count = state.peers.len(),
            "Peer joined room"
        );
        drop(state);
        Ok(room)
    }

    /// Removes a peer, closing everything it owned and every consumer other
    /// peers held on its producers. Tears the room down when it empties.
    pub async fn remove(&self, room_id: &str, peer_id: &str) -> Result<RemoveOutcome> {
        let Some(room) = self.lookup_by_id(room_id) else {
            return Ok(RemoveOutcome::default());
        };

        let mut state = room.lock().await;
        let Some(peer) = state.peers.remove(peer_id) else {
            return Ok(RemoveOutcome::default());
        };

        let mut handles = Vec::new();
        for other in state.peers.values_mut() {
            let stale: Vec<String> = other
                .consumers
                .values()
                .filter(|c| peer.producers.contains_key(&c.producer_id))
                .map(|c| c.id.clone())
                .collect();
            for consumer_id in stale {
                if let Some(consumer) = other.consumers.remove(&consumer_id) {
                    other.send(SfuEvent::ConsumerClosed {
                        consumer_id: consumer.id.clone(),
                        producer_id: consumer.producer_id,
                    });
                    handles.push(MediaHandle::Consumer(consumer.id));
                }
            }
        }
        handles.extend(peer.owned_handles());

        state.broadcast(
            &SfuEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            },
            None,
        );

        let mut outcome = RemoveOutcome {
            removed: true,
            ..RemoveOutcome::default()
        };
        if state.peers.is_empty() {
            room.mark_closed();
            outcome.room_closed = true;
            outcome.recording = state.recording.take();
            self.unregister(&room);
        }

        tracing::info!(
            room_id = %room.id,
            peer_id = %peer_id,
            peer_count = state.peers.len(),
            "Peer left room"
        );
        drop(state);

        for handle in handles {
            self.engine.close(handle).await;
        }
        if outcome.room_closed {
            self.engine.close(MediaHandle::Router(room.router.id.clone())).await;
            tracing::info!(room_id = %room.id, room_name = %room.name, "Room closed (empty)");
        }
        Ok(outcome)
    }

    /// Closes a room regardless of its occupants. Every peer receives
    /// `roomClosed`; returns the recording reservation that was held, if any.
    pub async fn teardown(&self, room: &Arc<Room>, reason: &str) -> Option<RoomRecording> {
        let mut state = room.lock().await;
        if room.is_closed() {
            return None;
        }
        room.mark_closed();

        let event = SfuEvent::RoomClosed {
            room_id: room.id.clone(),
            reason: reason.to_string(),
        };
        let mut handles = Vec::new();
        for (_, peer) in state.peers.drain() {
            peer.send(event.clone());
            handles.extend(peer.owned_handles());
        }
        let recording = state.recording.take();
        self.unregister(room);
        drop(state);

        for handle in handles {
            self.engine.close(handle).await;
        }
        self.engine.close(MediaHandle::Router(room.router.id.clone())).await;

        tracing::warn!(room_id = %room.id, room_name = %room.name, reason = %reason, "Room torn down");
        recording
    }

    /// Tears down every room whose routing context is in `router_ids`.
    pub async fn teardown_routers(
        &self,
        router_ids: &[String],
        reason: &str,
    ) -> Vec<(Arc<Room>, Option<RoomRecording>)> {
        let affected: Vec<Arc<Room>> = self
            .rooms
            .read()
            .values()
            .filter(|room| router_ids.contains(&room.router.id))
            .cloned()
            .collect();

        let mut closed = Vec::with_capacity(affected.len());
        for room in affected {
            let recording = self.teardown(&room, reason).await;
            closed.push((room, recording));
        }
        closed
    }

    fn unregister(&self, room: &Arc<Room>) {
        self.rooms.write().remove(&room.id);
        let mut names = self.names.lock();
        let owned = names
            .get(&room.name)
            .and_then(|slot| slot.room.get())
            .map(|current| Arc::ptr_eq(current, room))
            .unwrap_or(false);
        if owned {
            names.remove(&room.name);
        }
    }

    pub fn lookup_by_id(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(room_id).cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Room>> {
        self.names
            .lock()
            .get(name)
            .and_then(|slot| slot.room.get())
            .filter(|room| !room.is_closed())
            .cloned()
    }

    /// Peers of the room other than `peer_id`.
    pub async fn list_except(&self, room_id: &str, peer_id: &str) -> Result<Vec<PeerSummary>> {
        let room = self
            .lookup_by_id(room_id)
            .ok_or_else(|| SfuError::RoomNotFound(room_id.to_string()))?;
        let state = room.lock().await;
        let mut peers: Vec<PeerSummary> = state
            .peers
            .values()
            .filter(|p| p.id != peer_id)
            .map(|p| p.summary())
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        Ok(peers)
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().values().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::media::LocalMediaEngine;
    use tokio::sync::mpsc;

    fn registry() -> (RoomRegistry, Arc<LocalMediaEngine>) {
        let engine = Arc::new(LocalMediaEngine::new(MediaConfig::default()));
        (
            RoomRegistry::new(engine.clone(), Duration::from_secs(5)),
            engine,
        )
    }

    fn channel() -> (EventSender, mpsc::UnboundedReceiver<SfuEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (registry, engine) = registry();

        let first = registry.get_or_create("lobby").await.unwrap();
        let second = registry.get_or_create("lobby").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.room_count(), 1);
        assert_eq!(engine.counts().routers, 1);
        assert!(registry.lookup_by_name("lobby").is_some());
        assert!(registry.lookup_by_id(&first.id).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_shares_room() {
        let (registry, engine) = registry();
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create("same").await.unwrap().id.clone()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(engine.counts().routers, 1);
    }

    #[tokio::test]
    async fn test_failed_router_leaves_nothing_registered() {
        let config = MediaConfig {
            num_workers: 1,
            ..MediaConfig::default()
        };
        let engine = Arc::new(LocalMediaEngine::new(config));
        let registry = RoomRegistry::new(engine.clone(), Duration::from_secs(5));

        engine.kill_worker(0, "test");
        assert!(registry.get_or_create("doomed").await.is_err());
        assert_eq!(registry.room_count(), 0);
        assert!(registry.lookup_by_name("doomed").is_none());

        engine.restart_worker(0).await.unwrap();
        assert!(registry.get_or_create("doomed").await.is_ok());
    }

    #[tokio::test]
    async fn test_admit_sends_joined_then_peer_joined() {
        let (registry, _engine) = registry();
        let room = registry.get_or_create("r").await.unwrap();

        let (tx_a, mut rx_a) = channel();
        registry.admit(&room.id, "pA", "alice", tx_a).await.unwrap();
        let (tx_b, mut rx_b) = channel();
        registry.admit(&room.id, "pB", "bob", tx_b).await.unwrap();

        match rx_a.recv().await.unwrap() {
            SfuEvent::Joined { peer_id, peers, .. } => {
                assert_eq!(peer_id, "pA");
                assert!(peers.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rx_a.recv().await.unwrap() {
            SfuEvent::PeerJoined { peer_id, peer_name } => {
                assert_eq!(peer_id, "pB");
                assert_eq!(peer_name, "bob");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rx_b.recv().await.unwrap() {
            SfuEvent::Joined { peer_id, peers, .. } => {
                assert_eq!(peer_id, "pB");
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_id, "pA");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_admit_rejects_duplicate_peer() {
        let (registry, _engine) = registry();
        let room = registry.get_or_create("r").await.unwrap();

        let (tx, _rx) = channel();
        registry.admit(&room.id, "pA", "alice", tx.clone()).await.unwrap();
        let result = registry.admit(&room.id, "pA", "alice", tx).await;
        assert!(matches!(result, Err(SfuError::PeerAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_remove_last_peer_closes_room() {
        let (registry, engine) = registry();
        let room = registry.get_or_create("r").await.unwrap();
        let (tx_a, _rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.admit(&room.id, "pA", "alice", tx_a).await.unwrap();
        registry.admit(&room.id, "pB", "bob", tx_b).await.unwrap();

        let outcome = registry.remove(&room.id, "pA").await.unwrap();
        assert!(outcome.removed);
        assert!(!outcome.room_closed);
        assert_eq!(registry.list_except(&room.id, "nobody").await.unwrap().len(), 1);

        let _joined = rx_b.recv().await.unwrap();
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            SfuEvent::PeerLeft { peer_id } if peer_id == "pA"
        ));

        let outcome = registry.remove(&room.id, "pB").await.unwrap();
        assert!(outcome.room_closed);
        assert!(room.is_closed());
        assert_eq!(registry.room_count(), 0);
        assert!(registry.lookup_by_name("r").is_none());
        assert_eq!(engine.counts().routers, 0);

        let outcome = registry.remove(&room.id, "pB").await.unwrap();
        assert!(!outcome.removed);
    }

    #[tokio::test]
    async fn test_closed_room_is_replaced_by_name() {
        let (registry, _engine) = registry();
        let room = registry.get_or_create("r").await.unwrap();
        let (tx, _rx) = channel();
        registry.admit(&room.id, "pA", "alice", tx.clone()).await.unwrap();
        registry.remove(&room.id, "pA").await.unwrap();

        let result = registry.admit(&room.id, "pB", "bob", tx).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));

        let fresh = registry.get_or_create("r").await.unwrap();
        assert_ne!(fresh.id, room.id);
    }

    #[tokio::test]
    async fn test_teardown_routers_notifies_peers() {
        let (registry, engine) = registry();
        let room = registry.get_or_create("r").await.unwrap();
        let (tx, mut rx) = channel();
        registry.admit(&room.id, "pA", "alice", tx).await.unwrap();
        let _joined = rx.recv().await.unwrap();

        let closed = registry
            .teardown_routers(&[room.router.id.clone()], "worker died")
            .await;
        assert_eq!(closed.len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SfuEvent::RoomClosed { reason, .. } if reason == "worker died"
        ));
        assert_eq!(registry.room_count(), 0);
        assert_eq!(engine.counts().routers, 0);
    }
}
