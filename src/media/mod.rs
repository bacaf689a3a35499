//! Media engine integration surface.
//!
//! The orchestration layer only talks to [`MediaEngine`]; routers, transports,
//! producers and consumers are opaque ids owned by the engine.

pub mod codecs;
mod engine;
mod local;
pub mod types;

pub use engine::{with_timeout, MediaEngine};
pub use local::{EngineCounts, LocalMediaEngine};
pub use types::{
    ConsumerInfo, DtlsParameters, EngineFailure, IceCandidate, IceParameters, MediaHandle,
    MediaKind, PlainTransportInfo, RouterHandle, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportDirection, TransportInfo,
};
