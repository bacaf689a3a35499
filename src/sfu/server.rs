use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::peer::{Consumer, ConsumerState, EventSender, Producer, Transport};
use super::room::{Room, RoomRegistry, RoomState};
use super::signaling::{RoomStats, SfuEvent, TransportState};
use crate::config::Config;
use crate::error::{Result, SfuError};
use crate::media::{
    with_timeout, DtlsParameters, EngineFailure, MediaEngine, MediaHandle, MediaKind,
    RtpCapabilities, RtpParameters, TransportDirection,
};
use crate::recording::{RecordingManager, RecordingSession, Transcoder};

/// How many times `join` retries get-or-create plus admit when the room it
/// found closes before the peer could be admitted.
const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineHealth {
    Healthy,
    /// An engine failure is being handled.
    Degraded,
}

/// Room orchestration shared by every connection.
///
/// All room mutations go through the room's own lock. Engine calls are made
/// with the lock released and their results re-validated afterwards: if the
/// peer (or the object the call was about) disappeared meanwhile, whatever the
/// engine created is closed instead of attached.
pub struct SfuServer {
    config: Config,
    engine: Arc<dyn MediaEngine>,
    registry: RoomRegistry,
    recordings: Arc<RecordingManager>,
    health: watch::Sender<EngineHealth>,
    timeout: Duration,
}

impl SfuServer {
    pub fn new(config: Config, engine: Arc<dyn MediaEngine>, transcoder: Arc<dyn Transcoder>) -> Arc<Self> {
        let timeout = config.media.operation_timeout;
        let recordings = Arc::new(RecordingManager::new(
            config.recording.clone(),
            engine.clone(),
            transcoder,
            timeout,
        ));
        let (health, _) = watch::channel(EngineHealth::Healthy);

        Arc::new(Self {
            registry: RoomRegistry::new(engine.clone(), timeout),
            config,
            engine,
            recordings,
            health,
            timeout,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn recordings(&self) -> &Arc<RecordingManager> {
        &self.recordings
    }

    pub fn health(&self) -> EngineHealth {
        *self.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<EngineHealth> {
        self.health.subscribe()
    }

    /// Joins `room_name`, creating it if needed. The joiner receives `joined`
    /// before anyone else hears about it.
    pub async fn join(
        &self,
        peer_id: &str,
        room_name: &str,
        peer_name: &str,
        sender: EventSender,
    ) -> Result<Arc<Room>> {
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.registry.get_or_create(room_name).await?;
            match self.registry.admit(&room.id, peer_id, peer_name, sender.clone()).await {
                // The room emptied between lookup and admission; a fresh one is created next round.
                Err(SfuError::RoomClosed(_)) | Err(SfuError::RoomNotFound(_)) => continue,
                other => return other,
            }
        }
        Err(SfuError::RoomClosed(room_name.to_string()))
    }

    /// Removes the peer; closing the room cancels or stops its recording.
    pub async fn leave(&self, room: &Room, peer_id: &str) -> Result<bool> {
        let outcome = self.registry.remove(&room.id, peer_id).await?;
        if outcome.room_closed {
            self.recordings
                .on_room_closed(&room.id, outcome.recording, None)
                .await;
        }
        Ok(outcome.removed)
    }

    async fn discard(&self, room: &Room, peer_id: &str, handle: MediaHandle) {
        tracing::debug!(
            room_id = %room.id,
            peer_id = %peer_id,
            handle = ?handle,
            "Discarding engine resource created for a departed peer"
        );
        self.engine.close(handle).await;
    }

    pub async fn create_transport(
        &self,
        room: &Room,
        peer_id: &str,
        direction: TransportDirection,
    ) -> Result<()> {
        {
            let state = room.lock().await;
            if state.peer(peer_id)?.transports.contains_key(&direction) {
                return Err(SfuError::TransportAlreadyExists(direction.to_string()));
            }
        }

        let info = with_timeout(
            self.timeout,
            "createWebRtcTransport",
            self.engine.create_webrtc_transport(&room.router, direction),
        )
        .await?;

        let mut state = room.lock().await;
        let peer = match state.peer_mut(peer_id) {
            Ok(peer) => peer,
            Err(e) => {
                drop(state);
                self.discard(room, peer_id, MediaHandle::Transport(info.id)).await;
                return Err(e);
            }
        };
        if peer.transports.contains_key(&direction) {
            drop(state);
            self.engine.close(MediaHandle::Transport(info.id)).await;
            return Err(SfuError::TransportAlreadyExists(direction.to_string()));
        }

        peer.transports.insert(
            direction,
            Transport {
                id: info.id.clone(),
                direction,
                state: TransportState::Created,
            },
        );
        tracing::info!(room_id = %room.id, peer_id = %peer_id, transport_id = %info.id, direction = %direction, "Transport created");
        peer.send(SfuEvent::TransportCreated {
            transport_id: info.id,
            direction,
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
        });
        Ok(())
    }

    pub async fn connect_transport(
        &self,
        room: &Room,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        {
            let mut state = room.lock().await;
            let transport = state
                .peer_mut(peer_id)?
                .transport_by_id_mut(transport_id)
                .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
            if transport.state != TransportState::Created {
                return Err(SfuError::TransportAlreadyConnected(transport_id.to_string()));
            }
            transport.state = TransportState::Connecting;
        }

        let result = with_timeout(
            self.timeout,
            "connectTransport",
            self.engine.connect_transport(transport_id, dtls_parameters),
        )
        .await;

        let mut state = room.lock().await;
        let peer = state.peer_mut(peer_id)?;
        let Some(transport) = peer.transport_by_id_mut(transport_id) else {
            return result.and(Err(SfuError::TransportNotFound(transport_id.to_string())));
        };
        match result {
            Ok(()) => {
                transport.state = TransportState::Connected;
                peer.send(SfuEvent::TransportConnected {
                    transport_id: transport_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                transport.state = TransportState::Created;
                Err(e)
            }
        }
    }

    /// Creates a producer. An existing producer of the same kind is closed
    /// first; its consumers are told `consumerClosed`.
    pub async fn produce(
        &self,
        room: &Room,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<()> {
        {
            let state = room.lock().await;
            let transport = state
                .peer(peer_id)?
                .transport_by_id(transport_id)
                .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
            if transport.direction != TransportDirection::Send {
                return Err(SfuError::WrongTransportDirection(
                    transport_id.to_string(),
                    "produce".to_string(),
                ));
            }
        }

        let producer_id = with_timeout(
            self.timeout,
            "produce",
            self.engine.produce(transport_id, kind, rtp_parameters),
        )
        .await?;

        let mut state = room.lock().await;
        let replaced = match state.peer(peer_id) {
            Ok(peer) => peer.active_producer(kind).map(|p| p.id.clone()),
            Err(e) => {
                drop(state);
                self.discard(room, peer_id, MediaHandle::Producer(producer_id)).await;
                return Err(e);
            }
        };

        let stale = match &replaced {
            Some(old_id) => detach_producer(&mut state, peer_id, old_id),
            None => Vec::new(),
        };

        let peer = state.peer_mut(peer_id)?;
        peer.producers.insert(
            producer_id.clone(),
            Producer {
                id: producer_id.clone(),
                kind,
                transport_id: transport_id.to_string(),
            },
        );
        peer.send(SfuEvent::Produced {
            producer_id: producer_id.clone(),
            kind,
        });
        state.broadcast(
            &SfuEvent::NewProducer {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.clone(),
                kind,
            },
            Some(peer_id),
        );
        drop(state);

        tracing::info!(
            room_id = %room.id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            replaced = ?replaced,
            "Producer created"
        );
        for handle in stale {
            self.engine.close(handle).await;
        }
        Ok(())
    }

    pub async fn close_producer(&self, room: &Room, peer_id: &str, producer_id: &str) -> Result<()> {
        let stale = {
            let mut state = room.lock().await;
            let peer = state.peer(peer_id)?;
            if !peer.producers.contains_key(producer_id) {
                return Err(SfuError::ProducerNotFound(producer_id.to_string()));
            }
            let stale = detach_producer(&mut state, peer_id, producer_id);
            state.peer(peer_id)?.send(SfuEvent::ProducerClosed {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.to_string(),
            });
            stale
        };

        tracing::info!(room_id = %room.id, peer_id = %peer_id, producer_id = %producer_id, "Producer closed");
        for handle in stale {
            self.engine.close(handle).await;
        }
        Ok(())
    }

    /// Creates a paused consumer of another peer's producer on the caller's
    /// receive transport.
    pub async fn consume(
        &self,
        room: &Room,
        peer_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<()> {
        let (transport_id, producer_owner) = {
            let state = room.lock().await;
            let peer = state.peer(peer_id)?;
            if peer.producers.contains_key(producer_id) {
                return Err(SfuError::SelfConsumption(peer_id.to_string()));
            }
            let owner = state
                .peers
                .values()
                .find(|p| p.producers.contains_key(producer_id))
                .map(|p| p.id.clone())
                .ok_or_else(|| SfuError::ProducerNotFound(producer_id.to_string()))?;
            let transport = peer
                .transports
                .get(&TransportDirection::Recv)
                .ok_or_else(|| SfuError::TransportNotFound(TransportDirection::Recv.to_string()))?;
            (transport.id.clone(), owner)
        };

        let compatible = with_timeout(self.timeout, "canConsume", async {
            Ok(self
                .engine
                .can_consume(&room.router, producer_id, &rtp_capabilities)
                .await)
        })
        .await?;
        if !compatible {
            return Err(SfuError::CannotConsume(producer_id.to_string()));
        }

        let info = with_timeout(
            self.timeout,
            "consume",
            self.engine.consume(&transport_id, producer_id, &rtp_capabilities),
        )
        .await?;

        let mut state = room.lock().await;
        let producer_alive = state
            .peers
            .get(&producer_owner)
            .map(|p| p.producers.contains_key(producer_id))
            .unwrap_or(false);
        let peer = match state.peer_mut(peer_id) {
            Ok(peer) if producer_alive => peer,
            Ok(_) => {
                drop(state);
                self.engine.close(MediaHandle::Consumer(info.id)).await;
                return Err(SfuError::ProducerNotFound(producer_id.to_string()));
            }
            Err(e) => {
                drop(state);
                self.discard(room, peer_id, MediaHandle::Consumer(info.id)).await;
                return Err(e);
            }
        };

        peer.consumers.insert(
            info.id.clone(),
            Consumer {
                id: info.id.clone(),
                kind: info.kind,
                producer_id: producer_id.to_string(),
                transport_id,
                state: ConsumerState::Paused,
            },
        );
        tracing::info!(
            room_id = %room.id,
            peer_id = %peer_id,
            consumer_id = %info.id,
            producer_id = %producer_id,
            "Consumer created"
        );
        peer.send(SfuEvent::Consumed {
            consumer_id: info.id,
            producer_id: info.producer_id,
            kind: info.kind,
            rtp_parameters: info.rtp_parameters,
            paused: true,
        });
        Ok(())
    }

    pub async fn resume_consumer(&self, room: &Room, peer_id: &str, consumer_id: &str) -> Result<()> {
        {
            let state = room.lock().await;
            let peer = state.peer(peer_id)?;
            let consumer = peer
                .consumers
                .get(consumer_id)
                .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.to_string()))?;
            if consumer.state == ConsumerState::Active {
                peer.send(SfuEvent::ConsumerResumed {
                    consumer_id: consumer_id.to_string(),
                });
                return Ok(());
            }
        }

        with_timeout(
            self.timeout,
            "resumeConsumer",
            self.engine.resume_consumer(consumer_id),
        )
        .await?;

        let mut state = room.lock().await;
        let peer = state.peer_mut(peer_id)?;
        let consumer = peer
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer.state = ConsumerState::Active;
        peer.send(SfuEvent::ConsumerResumed {
            consumer_id: consumer_id.to_string(),
        });
        Ok(())
    }

    pub async fn room_stats(&self, room: &Room) -> RoomStats {
        let state = room.lock().await;
        let mut peers: Vec<_> = state.peers.values().map(|p| p.stats()).collect();
        peers.sort_by_key(|p| p.joined_at);
        RoomStats {
            room_id: room.id.clone(),
            room_name: room.name.clone(),
            created_at: room.created_at,
            peer_count: peers.len(),
            is_recording: state.is_recording(),
            peers,
        }
    }

    pub async fn start_recording(&self, room: &Arc<Room>) -> Result<RecordingSession> {
        self.recordings.start(room).await
    }

    pub async fn stop_recording(&self, room: &Room, recording_id: &str) -> Result<RecordingSession> {
        self.recordings.stop(room, recording_id).await
    }

    /// Deletes a recording from any room; a still-writing one is stopped and
    /// the stop announced in its room.
    pub async fn delete_recording(&self, recording_id: &str) -> Result<RecordingSession> {
        let room = self
            .recordings
            .get(recording_id)
            .and_then(|session| self.registry.lookup_by_id(&session.room_id));
        self.recordings.delete(room.as_deref(), recording_id).await
    }

    pub fn recordings_for(&self, room: &Room) -> Vec<RecordingSession> {
        self.recordings.list_for_room(&room.name)
    }

    /// Watches engine failures for the lifetime of the server.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let mut failures = self.engine.subscribe_failures();
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                match failures.recv().await {
                    Ok(failure) => server.handle_engine_failure(failure).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed = missed, "Engine failure notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::info!("Engine supervisor stopped");
        })
    }

    /// Rooms on the failed worker cannot be resumed: they are torn down and
    /// reported, then the worker is restarted for new rooms.
    pub async fn handle_engine_failure(&self, failure: EngineFailure) {
        self.health.send_replace(EngineHealth::Degraded);
        tracing::error!(
            worker_id = failure.worker_id,
            routers = failure.routers.len(),
            reason = %failure.reason,
            "Media engine failure, tearing down affected rooms"
        );

        let reason = format!("media worker {} failed: {}", failure.worker_id, failure.reason);
        let closed = self.registry.teardown_routers(&failure.routers, &reason).await;
        for (room, recording) in &closed {
            self.recordings
                .on_room_closed(&room.id, recording.clone(), Some(&reason))
                .await;
        }

        match self.engine.restart_worker(failure.worker_id).await {
            Ok(()) => {
                self.health.send_replace(EngineHealth::Healthy);
                tracing::info!(
                    worker_id = failure.worker_id,
                    rooms_closed = closed.len(),
                    "Media engine worker restarted"
                );
            }
            Err(e) => {
                tracing::error!(worker_id = failure.worker_id, error = %e, "Media engine worker restart failed");
            }
        }
    }

    /// Closes every room and finalizes recordings.
    pub async fn shutdown(&self) {
        for room in self.registry.rooms() {
            let recording = self.registry.teardown(&room, "server shutting down").await;
            self.recordings.on_room_closed(&room.id, recording, None).await;
        }
        self.recordings.shutdown().await;
        tracing::info!("SFU server shut down");
    }
}

/// Removes `producer_id` from its owner and every consumer of it from the
/// other peers. Returns the engine handles to close, consumers first.
fn detach_producer(state: &mut RoomState, owner_id: &str, producer_id: &str) -> Vec<MediaHandle> {
    let mut handles = Vec::new();
    for peer in state.peers.values_mut() {
        if peer.id == owner_id {
            continue;
        }
        for consumer_id in peer.consumers_of(producer_id) {
            if let Some(consumer) = peer.consumers.remove(&consumer_id) {
                peer.send(SfuEvent::ConsumerClosed {
                    consumer_id: consumer.id.clone(),
                    producer_id: producer_id.to_string(),
                });
                handles.push(MediaHandle::Consumer(consumer.id));
            }
        }
    }
    if let Some(owner) = state.peers.get_mut(owner_id) {
        owner.producers.remove(producer_id);
    }
    state.broadcast(
        &SfuEvent::ProducerClosed {
            peer_id: owner_id.to_string(),
            producer_id: producer_id.to_string(),
        },
        Some(owner_id),
    );
    handles.push(MediaHandle::Producer(producer_id.to_string()));
    handles
}
