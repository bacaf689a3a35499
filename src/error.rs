use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification reported to clients in `error{code}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Missing or mismatched entity, wrong protocol state.
    Validation,
    /// Codec or capability mismatch between consumer and producer.
    Capability,
    /// Room-level mutex already held (e.g. recording already active).
    Conflict,
    /// Media engine or transcoder could not allocate or start.
    Resource,
    /// Media engine process is gone; not recoverable for affected rooms.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Capability => "capability",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Resource => "resource",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Custom error types for the SFU server
#[derive(Debug, Error)]
pub enum SfuError {
    /// Room and peer management errors
    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Room {0} is closed")]
    RoomClosed(String),

    #[error("Peer {0} not found")]
    PeerNotFound(String),

    #[error("Peer {0} already exists")]
    PeerAlreadyExists(String),

    /// Signaling errors
    #[error("Connection has not joined a room")]
    NotJoined,

    #[error("Connection already joined room {0}")]
    AlreadyJoined(String),

    #[error("Invalid signaling message: {0}")]
    InvalidSignalingMessage(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Transport / producer / consumer errors
    #[error("Transport {0} not found")]
    TransportNotFound(String),

    #[error("A {0} transport already exists for this peer")]
    TransportAlreadyExists(String),

    #[error("Transport {0} is already connected")]
    TransportAlreadyConnected(String),

    #[error("Transport {0} cannot be used for {1}")]
    WrongTransportDirection(String, String),

    #[error("Producer {0} not found")]
    ProducerNotFound(String),

    #[error("Consumer {0} not found")]
    ConsumerNotFound(String),

    #[error("Peer {0} cannot consume its own producer")]
    SelfConsumption(String),

    #[error("Cannot consume producer {0} with the given RTP capabilities")]
    CannotConsume(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Recording errors
    #[error("Recording disabled")]
    RecordingDisabled,

    #[error("Recording {0} already active for this room")]
    RecordingAlreadyActive(String),

    #[error("Recording {0} is not active")]
    RecordingNotActive(String),

    #[error("Recording {0} not found")]
    RecordingNotFound(String),

    #[error("Transcoder error: {0}")]
    Transcoder(String),

    /// Media engine errors
    #[error("Media engine error: {0}")]
    MediaEngine(String),

    #[error("Media engine resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Media engine worker {0} died")]
    EngineFailed(String),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using SfuError
pub type Result<T> = std::result::Result<T, SfuError>;

impl SfuError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        SfuError::Internal(msg.into())
    }

    /// Helper to create media engine errors
    pub fn media(msg: impl Into<String>) -> Self {
        SfuError::MediaEngine(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SfuError::CannotConsume(_) | SfuError::UnsupportedCodec(_) => ErrorKind::Capability,
            SfuError::RecordingAlreadyActive(_) => ErrorKind::Conflict,
            SfuError::Transcoder(_)
            | SfuError::MediaEngine(_)
            | SfuError::ResourceExhausted(_)
            | SfuError::Timeout(_)
            | SfuError::Io(_)
            | SfuError::Internal(_) => ErrorKind::Resource,
            SfuError::EngineFailed(_) => ErrorKind::Fatal,
            _ => ErrorKind::Validation,
        }
    }
}
