use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::peer::EventSender;
use super::room::Room;
use super::server::SfuServer;
use super::signaling::{SfuEvent, SfuRequest};
use crate::error::{Result, SfuError};

enum SessionPhase {
    /// Only `join` is accepted.
    Anonymous,
    Joined(Arc<Room>),
    /// Transport gone; nothing is accepted anymore.
    Closed,
}

/// Signaling state of one client connection.
///
/// A peer id is assigned when the connection opens and replaced whenever the
/// connection goes back to `Anonymous`, so every membership gets an id of its
/// own and a rejoin is never mistaken for the earlier departure. `join` and
/// `disconnect` both hold the phase lock for their whole duration, so a
/// disconnect arriving mid-join waits and then removes the fresh peer. Other
/// requests only read the phase and run against the room directly.
pub struct SfuConnection {
    server: Arc<SfuServer>,
    peer_id: RwLock<String>,
    sender: EventSender,
    phase: Mutex<SessionPhase>,
}

impl SfuConnection {
    pub fn new(server: Arc<SfuServer>, sender: EventSender) -> Self {
        Self {
            server,
            peer_id: RwLock::new(Uuid::new_v4().to_string()),
            sender,
            phase: Mutex::new(SessionPhase::Anonymous),
        }
    }

    /// Id of the current membership, or the one the next `join` will use.
    pub fn peer_id(&self) -> String {
        self.peer_id.read().clone()
    }

    fn renew_peer_id(&self) {
        *self.peer_id.write() = Uuid::new_v4().to_string();
    }

    fn send(&self, event: SfuEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!(peer_id = %self.peer_id(), "Connection closed, dropping event");
        }
    }

    /// Parses and handles one text frame.
    pub async fn handle_text(&self, text: &str) {
        match serde_json::from_str::<SfuRequest>(text) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                tracing::warn!(peer_id = %self.peer_id(), error = %e, raw_message = %text, "Failed to parse SFU message");
                let error = SfuError::InvalidSignalingMessage(e.to_string());
                self.send(SfuEvent::Error {
                    message: error.to_string(),
                    code: error.kind(),
                });
            }
        }
    }

    /// Runs a request; any failure is reported to this connection only.
    pub async fn handle_request(&self, request: SfuRequest) {
        let name = request.name();
        tracing::debug!(peer_id = %self.peer_id(), request = name, "Handling SFU request");

        if let Err(e) = self.dispatch(request).await {
            tracing::warn!(peer_id = %self.peer_id(), request = name, error = %e, "SFU request failed");
            self.send(SfuEvent::Error {
                message: e.to_string(),
                code: e.kind(),
            });
        }
    }

    async fn dispatch(&self, request: SfuRequest) -> Result<()> {
        let room = match request {
            SfuRequest::Join {
                room_name,
                peer_name,
            } => return self.join(&room_name, &peer_name).await,
            SfuRequest::Leave => return self.leave().await,
            _ => self.joined_room().await?,
        };
        let server = &self.server;
        let peer_id = self.peer_id();
        let peer_id = peer_id.as_str();

        match request {
            SfuRequest::Join { .. } | SfuRequest::Leave => Ok(()),
            SfuRequest::CreateTransport { direction } => {
                server.create_transport(&room, peer_id, direction).await
            }
            SfuRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                server
                    .connect_transport(&room, peer_id, &transport_id, dtls_parameters)
                    .await
            }
            SfuRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                server
                    .produce(&room, peer_id, &transport_id, kind, rtp_parameters)
                    .await
            }
            SfuRequest::CloseProducer { producer_id } => {
                server.close_producer(&room, peer_id, &producer_id).await
            }
            SfuRequest::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                server
                    .consume(&room, peer_id, &producer_id, rtp_capabilities)
                    .await
            }
            SfuRequest::ResumeConsumer { consumer_id } => {
                server.resume_consumer(&room, peer_id, &consumer_id).await
            }
            SfuRequest::StartRecording => server.start_recording(&room).await.map(|_| ()),
            SfuRequest::StopRecording { recording_id } => {
                server.stop_recording(&room, &recording_id).await.map(|_| ())
            }
            SfuRequest::DeleteRecording { recording_id } => {
                let session = server
                    .recordings()
                    .get(&recording_id)
                    .filter(|s| s.room_name == room.name)
                    .ok_or_else(|| SfuError::RecordingNotFound(recording_id.clone()))?;
                server.delete_recording(&session.id).await?;
                self.send(SfuEvent::RecordingDeleted { recording_id });
                Ok(())
            }
            SfuRequest::GetRoomStats => {
                let stats = server.room_stats(&room).await;
                self.send(SfuEvent::RoomStats(stats));
                Ok(())
            }
            SfuRequest::GetRecordings => {
                self.send(SfuEvent::Recordings {
                    recordings: server.recordings_for(&room),
                });
                Ok(())
            }
        }
    }

    /// The bound room. A room torn down under us (engine failure, shutdown)
    /// sends the connection back to `Anonymous`.
    async fn joined_room(&self) -> Result<Arc<Room>> {
        let mut phase = self.phase.lock().await;
        match &*phase {
            SessionPhase::Joined(room) if room.is_closed() => {
                *phase = SessionPhase::Anonymous;
                self.renew_peer_id();
                Err(SfuError::NotJoined)
            }
            SessionPhase::Joined(room) => Ok(room.clone()),
            _ => Err(SfuError::NotJoined),
        }
    }

    async fn join(&self, room_name: &str, peer_name: &str) -> Result<()> {
        if room_name.trim().is_empty() {
            return Err(SfuError::InvalidSignalingMessage("roomName must not be empty".to_string()));
        }
        if peer_name.trim().is_empty() {
            return Err(SfuError::InvalidSignalingMessage("peerName must not be empty".to_string()));
        }

        let mut phase = self.phase.lock().await;
        match &*phase {
            SessionPhase::Joined(room) if !room.is_closed() => {
                return Err(SfuError::AlreadyJoined(room.name.clone()))
            }
            SessionPhase::Closed => return Err(SfuError::NotJoined),
            SessionPhase::Joined(_) => {
                *phase = SessionPhase::Anonymous;
                self.renew_peer_id();
            }
            SessionPhase::Anonymous => {}
        }

        let peer_id = self.peer_id();
        let room = self
            .server
            .join(&peer_id, room_name, peer_name, self.sender.clone())
            .await?;
        tracing::info!(peer_id = %peer_id, room_id = %room.id, room_name = %room.name, "Connection joined room");
        *phase = SessionPhase::Joined(room);
        Ok(())
    }

    /// Explicit leave: same teardown as a disconnect, but the connection may
    /// join again afterwards.
    async fn leave(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        let room = match std::mem::replace(&mut *phase, SessionPhase::Anonymous) {
            SessionPhase::Joined(room) => room,
            other => {
                *phase = other;
                return Err(SfuError::NotJoined);
            }
        };

        let peer_id = self.peer_id();
        self.renew_peer_id();
        self.server.leave(&room, &peer_id).await?;
        self.send(SfuEvent::Left { peer_id });
        Ok(())
    }

    /// Transport-level close. Idempotent.
    pub async fn disconnect(&self) {
        let mut phase = self.phase.lock().await;
        if let SessionPhase::Joined(room) = std::mem::replace(&mut *phase, SessionPhase::Closed) {
            let peer_id = self.peer_id();
            match self.server.leave(&room, &peer_id).await {
                Ok(_) => tracing::info!(peer_id = %peer_id, room_id = %room.id, "Peer disconnected"),
                Err(e) => tracing::error!(peer_id = %peer_id, error = %e, "Failed to remove disconnected peer"),
            }
        }
    }
}
