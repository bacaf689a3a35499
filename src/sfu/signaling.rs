use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::media::types::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportDirection,
};
use crate::recording::RecordingSession;

/// Client → server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SfuRequest {
    Join {
        room_name: String,
        peer_name: String,
    },

    Leave,

    CreateTransport {
        direction: TransportDirection,
    },

    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },

    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    CloseProducer {
        producer_id: String,
    },

    Consume {
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },

    ResumeConsumer {
        consumer_id: String,
    },

    StartRecording,

    StopRecording {
        recording_id: String,
    },

    DeleteRecording {
        recording_id: String,
    },

    GetRoomStats,

    GetRecordings,
}

impl SfuRequest {
    pub fn name(&self) -> &'static str {
        match self {
            SfuRequest::Join { .. } => "join",
            SfuRequest::Leave => "leave",
            SfuRequest::CreateTransport { .. } => "createTransport",
            SfuRequest::ConnectTransport { .. } => "connectTransport",
            SfuRequest::Produce { .. } => "produce",
            SfuRequest::CloseProducer { .. } => "closeProducer",
            SfuRequest::Consume { .. } => "consume",
            SfuRequest::ResumeConsumer { .. } => "resumeConsumer",
            SfuRequest::StartRecording => "startRecording",
            SfuRequest::StopRecording { .. } => "stopRecording",
            SfuRequest::DeleteRecording { .. } => "deleteRecording",
            SfuRequest::GetRoomStats => "getRoomStats",
            SfuRequest::GetRecordings => "getRecordings",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: String,
    pub kind: MediaKind,
}

/// Entry of the existing-peer list delivered with `joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    pub peer_name: String,
    #[serde(default)]
    pub producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub transport_id: String,
    pub direction: TransportDirection,
    pub state: TransportState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStats {
    pub peer_id: String,
    pub peer_name: String,
    pub joined_at: DateTime<Utc>,
    pub transports: Vec<TransportStats>,
    pub producers: Vec<ProducerSummary>,
    pub consumers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: String,
    pub room_name: String,
    pub created_at: DateTime<Utc>,
    pub peer_count: usize,
    pub is_recording: bool,
    pub peers: Vec<PeerStats>,
}

/// Server → client messages: direct responses and room broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SfuEvent {
    Joined {
        peer_id: String,
        room_id: String,
        router_rtp_capabilities: RtpCapabilities,
        is_recording: bool,
        /// The room's running recording, if `is_recording`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recording_id: Option<String>,
        peers: Vec<PeerSummary>,
    },

    PeerJoined {
        peer_id: String,
        peer_name: String,
    },

    PeerLeft {
        peer_id: String,
    },

    Left {
        peer_id: String,
    },

    TransportCreated {
        transport_id: String,
        direction: TransportDirection,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },

    TransportConnected {
        transport_id: String,
    },

    Produced {
        producer_id: String,
        kind: MediaKind,
    },

    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },

    ProducerClosed {
        peer_id: String,
        producer_id: String,
    },

    Consumed {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
    },

    ConsumerResumed {
        consumer_id: String,
    },

    ConsumerClosed {
        consumer_id: String,
        producer_id: String,
    },

    RecordingStarted {
        recording_id: String,
        start_time: DateTime<Utc>,
    },

    RecordingStopped {
        recording_id: String,
        end_time: DateTime<Utc>,
        file_path: String,
    },

    RecordingFailed {
        recording_id: String,
        reason: String,
    },

    RecordingDeleted {
        recording_id: String,
    },

    RoomStats(RoomStats),

    Recordings {
        recordings: Vec<RecordingSession>,
    },

    RoomClosed {
        room_id: String,
        reason: String,
    },

    Error {
        message: String,
        code: ErrorKind,
    },
}
