// Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use sfu_rooms::config::{Config, MediaConfig, RecordingConfig, ServerConfig};
use sfu_rooms::error::Result;
use sfu_rooms::media::types::{
    ConsumerInfo, DtlsFingerprint, DtlsParameters, DtlsRole, EngineFailure, MediaHandle,
    PlainTransportInfo, RouterHandle, RtpCodecParameters, RtpEncodingParameters, TransportInfo,
};
use sfu_rooms::media::{
    LocalMediaEngine, MediaEngine, MediaKind, RtpCapabilities, RtpParameters, TransportDirection,
};
use sfu_rooms::recording::{TranscodeHandle, TranscodeRequest, Transcoder};
use sfu_rooms::sfu::{SfuConnection, SfuEvent, SfuRequest, SfuServer};

/// Confirms immediately and writes a small file when stopped.
#[derive(Default)]
pub struct FakeTranscoder {
    starts: AtomicUsize,
}

impl FakeTranscoder {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn start(&self, request: TranscodeRequest) -> Result<TranscodeHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (ready_tx, ready) = oneshot::channel();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let (done_tx, done) = oneshot::channel();
        let _ = ready_tx.send(Ok(()));
        tokio::spawn(async move {
            let _ = stop_rx.await;
            let written = tokio::fs::write(&request.output_path, b"webm-bytes").await;
            let _ = done_tx.send(written.map_err(|e| e.to_string()));
        });
        Ok(TranscodeHandle { ready, stop, done })
    }
}

/// Local engine whose `produce` and `can_consume` answer only after their
/// configured delays.
pub struct SlowEngine {
    pub inner: LocalMediaEngine,
    pub produce_delay: Duration,
    pub can_consume_delay: Duration,
}

#[async_trait]
impl MediaEngine for SlowEngine {
    async fn create_router(&self) -> Result<RouterHandle> {
        self.inner.create_router().await
    }

    fn rtp_capabilities(&self, router: &RouterHandle) -> Result<RtpCapabilities> {
        self.inner.rtp_capabilities(router)
    }

    async fn create_webrtc_transport(
        &self,
        router: &RouterHandle,
        direction: TransportDirection,
    ) -> Result<TransportInfo> {
        self.inner.create_webrtc_transport(router, direction).await
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: DtlsParameters) -> Result<()> {
        self.inner.connect_transport(transport_id, dtls_parameters).await
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String> {
        let id = self.inner.produce(transport_id, kind, rtp_parameters).await?;
        tokio::time::sleep(self.produce_delay).await;
        Ok(id)
    }

    async fn can_consume(
        &self,
        router: &RouterHandle,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        tokio::time::sleep(self.can_consume_delay).await;
        self.inner.can_consume(router, producer_id, rtp_capabilities).await
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        self.inner.consume(transport_id, producer_id, rtp_capabilities).await
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<()> {
        self.inner.resume_consumer(consumer_id).await
    }

    async fn create_plain_transport(&self, router: &RouterHandle) -> Result<PlainTransportInfo> {
        self.inner.create_plain_transport(router).await
    }

    async fn close(&self, handle: MediaHandle) {
        self.inner.close(handle).await
    }

    fn subscribe_failures(&self) -> broadcast::Receiver<EngineFailure> {
        self.inner.subscribe_failures()
    }

    async fn restart_worker(&self, worker_id: usize) -> Result<()> {
        self.inner.restart_worker(worker_id).await
    }
}

pub fn test_config(output_dir: &std::path::Path) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        media: MediaConfig {
            operation_timeout: Duration::from_secs(5),
            ..MediaConfig::default()
        },
        recording: RecordingConfig {
            output_dir: output_dir.to_path_buf(),
            start_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(2),
            ..RecordingConfig::default()
        },
    }
}

/// One signaling connection driven through channels.
pub struct TestPeer {
    pub connection: Arc<SfuConnection>,
    pub events: mpsc::UnboundedReceiver<SfuEvent>,
}

impl TestPeer {
    pub fn connect(server: &Arc<SfuServer>) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        Self {
            connection: Arc::new(SfuConnection::new(server.clone(), tx)),
            events,
        }
    }

    pub fn id(&self) -> String {
        self.connection.peer_id()
    }

    pub async fn request(&self, request: SfuRequest) {
        self.connection.handle_request(request).await;
    }

    pub async fn next(&mut self) -> SfuEvent {
        match tokio::time::timeout(Duration::from_secs(5), self.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for an event"),
        }
    }

    /// Skips events until one matches.
    pub async fn until<F: Fn(&SfuEvent) -> bool>(&mut self, pred: F) -> SfuEvent {
        loop {
            let event = self.next().await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Direct reply to the last request: the first event matching `pred`, or
    /// the error that took its place. Room broadcasts in between are skipped.
    pub async fn reply<F: Fn(&SfuEvent) -> bool>(&mut self, pred: F) -> SfuEvent {
        self.until(|e| pred(e) || matches!(e, SfuEvent::Error { .. })).await
    }

    pub fn drain(&mut self) {
        while self.events.try_recv().is_ok() {}
    }

    pub async fn join(&mut self, room: &str, name: &str) -> SfuEvent {
        self.request(SfuRequest::Join {
            room_name: room.to_string(),
            peer_name: name.to_string(),
        })
        .await;
        self.next().await
    }

    /// Creates and connects a transport, returning its id.
    pub async fn transport(&mut self, direction: TransportDirection) -> String {
        self.request(SfuRequest::CreateTransport { direction }).await;
        let transport_id = match self.reply(|e| matches!(e, SfuEvent::TransportCreated { .. })).await {
            SfuEvent::TransportCreated { transport_id, .. } => transport_id,
            other => panic!("expected transportCreated, got {:?}", other),
        };
        self.request(SfuRequest::ConnectTransport {
            transport_id: transport_id.clone(),
            dtls_parameters: dtls(),
        })
        .await;
        match self.reply(|e| matches!(e, SfuEvent::TransportConnected { .. })).await {
            SfuEvent::TransportConnected { .. } => transport_id,
            other => panic!("expected transportConnected, got {:?}", other),
        }
    }

    pub async fn produce_video(&mut self, transport_id: &str) -> String {
        self.request(SfuRequest::Produce {
            transport_id: transport_id.to_string(),
            kind: MediaKind::Video,
            rtp_parameters: vp8_params(),
        })
        .await;
        match self.reply(|e| matches!(e, SfuEvent::Produced { .. })).await {
            SfuEvent::Produced { producer_id, .. } => producer_id,
            other => panic!("expected produced, got {:?}", other),
        }
    }
}

pub fn dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".into(),
            value: "AA:BB:CC".into(),
        }],
    }
}

pub fn vp8_params() -> RtpParameters {
    RtpParameters {
        mid: Some("0".into()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".into(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![],
        }],
        encodings: vec![RtpEncodingParameters { ssrc: Some(4242) }],
    }
}

pub fn capabilities_of(joined: &SfuEvent) -> RtpCapabilities {
    match joined {
        SfuEvent::Joined {
            router_rtp_capabilities,
            ..
        } => router_rtp_capabilities.clone(),
        other => panic!("expected joined, got {:?}", other),
    }
}
