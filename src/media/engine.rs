use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;

use super::types::{
    ConsumerInfo, DtlsParameters, EngineFailure, MediaHandle, MediaKind, PlainTransportInfo,
    RouterHandle, RtpCapabilities, RtpParameters, TransportDirection, TransportInfo,
};
use crate::error::{Result, SfuError};

/// Narrow capability interface onto the media engine.
///
/// Every operation may fail; failures come back as [`crate::error::SfuError`]
/// values and never take the orchestration layer down. Handles are opaque ids,
/// the engine owns the objects behind them.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Allocates a routing context for one room.
    async fn create_router(&self) -> Result<RouterHandle>;

    /// Codec capabilities of a routing context, handed to joining clients.
    fn rtp_capabilities(&self, router: &RouterHandle) -> Result<RtpCapabilities>;

    async fn create_webrtc_transport(
        &self,
        router: &RouterHandle,
        direction: TransportDirection,
    ) -> Result<TransportInfo>;

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: DtlsParameters) -> Result<()>;

    /// Returns the new producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String>;

    async fn can_consume(
        &self,
        router: &RouterHandle,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool;

    /// Consumers always start paused.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<()>;

    /// Server-side feed used by recordings.
    async fn create_plain_transport(&self, router: &RouterHandle) -> Result<PlainTransportInfo>;

    /// Releases a handle and everything hanging off it. Closing an unknown
    /// handle is a no-op.
    async fn close(&self, handle: MediaHandle);

    /// Worker death notifications.
    fn subscribe_failures(&self) -> broadcast::Receiver<EngineFailure>;

    async fn restart_worker(&self, worker_id: usize) -> Result<()>;
}

/// Bounds an engine call; an elapsed deadline becomes [`SfuError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation = %operation, timeout_ms = timeout.as_millis() as u64, "Media engine call timed out");
            Err(SfuError::Timeout(operation.to_string()))
        }
    }
}
