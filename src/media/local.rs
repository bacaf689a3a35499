use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::codecs;
use super::engine::MediaEngine;
use super::types::{
    ConsumerInfo, DtlsFingerprint, DtlsParameters, DtlsRole, EngineFailure, IceCandidate,
    IceParameters, MediaHandle, MediaKind, PlainTransportInfo, RouterHandle, RtpCapabilities,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, TransportDirection, TransportInfo,
};
use crate::config::MediaConfig;
use crate::error::{Result, SfuError};

const HOST_CANDIDATE_PRIORITY: u32 = 1076302079;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounts {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    WebRtc(TransportDirection),
    Plain,
}

struct Worker {
    alive: bool,
    routers: HashSet<String>,
}

struct RouterState {
    worker_id: usize,
    capabilities: RtpCapabilities,
    transports: HashSet<String>,
}

struct TransportState {
    router_id: String,
    kind: TransportKind,
    port: u16,
    connected: bool,
    producers: HashSet<String>,
    consumers: HashSet<String>,
}

struct ProducerState {
    transport_id: String,
    router_id: String,
    codec: RtpCodecParameters,
    consumers: HashSet<String>,
}

struct ConsumerState {
    transport_id: String,
    producer_id: String,
    paused: bool,
}

struct EngineState {
    workers: Vec<Worker>,
    next_worker: usize,
    routers: HashMap<String, RouterState>,
    transports: HashMap<String, TransportState>,
    producers: HashMap<String, ProducerState>,
    consumers: HashMap<String, ConsumerState>,
    ports_in_use: HashSet<u16>,
    next_port: u16,
}

impl EngineState {
    fn live_router(&self, router_id: &str) -> Result<&RouterState> {
        let router = self
            .routers
            .get(router_id)
            .ok_or_else(|| SfuError::media(format!("router {} not found", router_id)))?;
        match self.workers.get(router.worker_id) {
            Some(worker) if worker.alive => Ok(router),
            _ => Err(SfuError::EngineFailed(router.worker_id.to_string())),
        }
    }

    fn allocate_port(&mut self, min: u16, max: u16) -> Result<u16> {
        let span = u32::from(max - min) + 1;
        for offset in 0..span {
            let candidate = min + ((u32::from(self.next_port.saturating_sub(min)) + offset) % span) as u16;
            if self.ports_in_use.insert(candidate) {
                self.next_port = if candidate == max { min } else { candidate + 1 };
                return Ok(candidate);
            }
        }
        Err(SfuError::ResourceExhausted(format!(
            "no free port in {}-{}",
            min, max
        )))
    }

    fn close_consumer(&mut self, consumer_id: &str) {
        if let Some(consumer) = self.consumers.remove(consumer_id) {
            if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
                transport.consumers.remove(consumer_id);
            }
            if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
                producer.consumers.remove(consumer_id);
            }
        }
    }

    fn close_producer(&mut self, producer_id: &str) {
        if let Some(producer) = self.producers.remove(producer_id) {
            for consumer_id in producer.consumers {
                self.close_consumer(&consumer_id);
            }
            if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
                transport.producers.remove(producer_id);
            }
        }
    }

    fn close_transport(&mut self, transport_id: &str) {
        if let Some(transport) = self.transports.remove(transport_id) {
            for producer_id in transport.producers {
                self.close_producer(&producer_id);
            }
            for consumer_id in transport.consumers {
                self.close_consumer(&consumer_id);
            }
            self.ports_in_use.remove(&transport.port);
            if let Some(router) = self.routers.get_mut(&transport.router_id) {
                router.transports.remove(transport_id);
            }
        }
    }

    fn close_router(&mut self, router_id: &str) {
        if let Some(router) = self.routers.remove(router_id) {
            for transport_id in router.transports {
                self.close_transport(&transport_id);
            }
            if let Some(worker) = self.workers.get_mut(router.worker_id) {
                worker.routers.remove(router_id);
            }
        }
    }
}

/// In-process media engine.
///
/// Keeps the full object graph (workers, routers, transports, producers,
/// consumers) with the same lifecycle rules as an external SFU worker: closing
/// a parent closes its children, consumers start paused, ports come from the
/// configured RTC range.
pub struct LocalMediaEngine {
    config: MediaConfig,
    state: Mutex<EngineState>,
    failures: broadcast::Sender<EngineFailure>,
}

impl LocalMediaEngine {
    pub fn new(config: MediaConfig) -> Self {
        let workers = (0..config.num_workers.max(1))
            .map(|_| Worker {
                alive: true,
                routers: HashSet::new(),
            })
            .collect();
        let (failures, _) = broadcast::channel(16);

        tracing::info!(
            workers = config.num_workers.max(1),
            min_port = config.rtc_min_port,
            max_port = config.rtc_max_port,
            "Local media engine initialized"
        );

        Self {
            state: Mutex::new(EngineState {
                workers,
                next_worker: 0,
                routers: HashMap::new(),
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
                ports_in_use: HashSet::new(),
                next_port: config.rtc_min_port,
            }),
            config,
            failures,
        }
    }

    /// Takes a worker down: every routing context it hosted is closed and an
    /// [`EngineFailure`] is published.
    pub fn kill_worker(&self, worker_id: usize, reason: &str) {
        let routers = {
            let mut state = self.state.lock();
            let routers: Vec<String> = match state.workers.get_mut(worker_id) {
                Some(worker) if worker.alive => {
                    worker.alive = false;
                    worker.routers.iter().cloned().collect()
                }
                _ => return,
            };
            for router_id in &routers {
                state.close_router(router_id);
            }
            routers
        };

        tracing::error!(
            worker_id = worker_id,
            routers = routers.len(),
            reason = %reason,
            "Media engine worker died"
        );

        let _ = self.failures.send(EngineFailure {
            worker_id,
            routers,
            reason: reason.to_string(),
        });
    }

    pub fn counts(&self) -> EngineCounts {
        let state = self.state.lock();
        EngineCounts {
            routers: state.routers.len(),
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    pub fn is_consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.state.lock().consumers.get(consumer_id).map(|c| c.paused)
    }

    fn feed_ip(&self) -> IpAddr {
        if self.config.listen_ip.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.config.listen_ip
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    async fn create_router(&self) -> Result<RouterHandle> {
        let mut state = self.state.lock();
        let worker_count = state.workers.len();

        let worker_id = (0..worker_count)
            .map(|offset| (state.next_worker + offset) % worker_count)
            .find(|id| state.workers.get(*id).map(|w| w.alive).unwrap_or(false))
            .ok_or_else(|| SfuError::EngineFailed("all workers".to_string()))?;
        state.next_worker = (worker_id + 1) % worker_count;

        let id = Uuid::new_v4().to_string();
        state.routers.insert(
            id.clone(),
            RouterState {
                worker_id,
                capabilities: codecs::router_capabilities(),
                transports: HashSet::new(),
            },
        );
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.routers.insert(id.clone());
        }

        tracing::debug!(router_id = %id, worker_id = worker_id, "Router created");
        Ok(RouterHandle { id, worker_id })
    }

    fn rtp_capabilities(&self, router: &RouterHandle) -> Result<RtpCapabilities> {
        let state = self.state.lock();
        Ok(state.live_router(&router.id)?.capabilities.clone())
    }

    async fn create_webrtc_transport(
        &self,
        router: &RouterHandle,
        direction: TransportDirection,
    ) -> Result<TransportInfo> {
        let mut state = self.state.lock();
        state.live_router(&router.id)?;
        let port = state.allocate_port(self.config.rtc_min_port, self.config.rtc_max_port)?;

        let id = Uuid::new_v4().to_string();
        state.transports.insert(
            id.clone(),
            TransportState {
                router_id: router.id.clone(),
                kind: TransportKind::WebRtc(direction),
                port,
                connected: false,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );
        if let Some(router_state) = state.routers.get_mut(&router.id) {
            router_state.transports.insert(id.clone());
        }

        tracing::debug!(transport_id = %id, direction = %direction, port = port, "WebRTC transport created");

        Ok(TransportInfo {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: HOST_CANDIDATE_PRIORITY,
                ip: self.config.public_ip(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
        })
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: DtlsParameters) -> Result<()> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(SfuError::media("DTLS parameters carry no fingerprint"));
        }

        let mut state = self.state.lock();
        let router_id = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
        state.live_router(&router_id)?;

        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
        if transport.kind == TransportKind::Plain {
            return Err(SfuError::media("plain transports are not DTLS-connected"));
        }
        if transport.connected {
            return Err(SfuError::media(format!("transport {} already connected", transport_id)));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String> {
        let mut state = self.state.lock();
        let (router_id, transport_kind) = state
            .transports
            .get(transport_id)
            .map(|t| (t.router_id.clone(), t.kind))
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
        if transport_kind != TransportKind::WebRtc(TransportDirection::Send) {
            return Err(SfuError::WrongTransportDirection(
                transport_id.to_string(),
                "produce".to_string(),
            ));
        }

        let codec = rtp_parameters
            .codecs
            .iter()
            .find(|codec| !codecs::is_rtx(&codec.mime_type))
            .cloned()
            .ok_or_else(|| SfuError::UnsupportedCodec("no media codec in RTP parameters".to_string()))?;
        if codecs::kind_of_mime(&codec.mime_type) != Some(kind) {
            return Err(SfuError::UnsupportedCodec(format!(
                "{} is not a {} codec",
                codec.mime_type, kind
            )));
        }

        let router = state.live_router(&router_id)?;
        let capability = codecs::find_matching(&router.capabilities, &codec)
            .ok_or_else(|| SfuError::UnsupportedCodec(codec.mime_type.clone()))?;
        let normalized = RtpCodecParameters {
            mime_type: capability.mime_type.clone(),
            ..codec
        };

        let id = Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            ProducerState {
                transport_id: transport_id.to_string(),
                router_id,
                codec: normalized,
                consumers: HashSet::new(),
            },
        );
        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.producers.insert(id.clone());
        }

        tracing::debug!(producer_id = %id, kind = %kind, "Producer created");
        Ok(id)
    }

    async fn can_consume(
        &self,
        router: &RouterHandle,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        let state = self.state.lock();
        match state.producers.get(producer_id) {
            Some(producer) if producer.router_id == router.id => {
                codecs::find_matching(rtp_capabilities, &producer.codec).is_some()
            }
            _ => false,
        }
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        let mut state = self.state.lock();
        let (router_id, transport_kind, existing) = state
            .transports
            .get(transport_id)
            .map(|t| (t.router_id.clone(), t.kind, t.consumers.len()))
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
        if transport_kind == TransportKind::WebRtc(TransportDirection::Send) {
            return Err(SfuError::WrongTransportDirection(
                transport_id.to_string(),
                "consume".to_string(),
            ));
        }
        state.live_router(&router_id)?;

        let producer = state
            .producers
            .get(producer_id)
            .filter(|p| p.router_id == router_id)
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.to_string()))?;
        let capability = codecs::find_matching(rtp_capabilities, &producer.codec)
            .ok_or_else(|| SfuError::CannotConsume(producer_id.to_string()))?;
        let kind = codecs::kind_of_mime(&producer.codec.mime_type)
            .ok_or_else(|| SfuError::UnsupportedCodec(producer.codec.mime_type.clone()))?;

        let codec = RtpCodecParameters {
            payload_type: capability
                .preferred_payload_type
                .unwrap_or(producer.codec.payload_type),
            rtcp_feedback: capability.rtcp_feedback.clone(),
            ..producer.codec.clone()
        };
        let rtp_parameters = RtpParameters {
            mid: Some(existing.to_string()),
            codecs: vec![codec],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::thread_rng().gen()),
            }],
        };

        let id = Uuid::new_v4().to_string();
        state.consumers.insert(
            id.clone(),
            ConsumerState {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                paused: true,
            },
        );
        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.consumers.insert(id.clone());
        }
        if let Some(producer) = state.producers.get_mut(producer_id) {
            producer.consumers.insert(id.clone());
        }

        tracing::debug!(consumer_id = %id, producer_id = %producer_id, "Consumer created (paused)");
        Ok(ConsumerInfo {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters,
            paused: true,
        })
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer.paused = false;
        Ok(())
    }

    async fn create_plain_transport(&self, router: &RouterHandle) -> Result<PlainTransportInfo> {
        let mut state = self.state.lock();
        state.live_router(&router.id)?;
        let port = state.allocate_port(self.config.rtc_min_port, self.config.rtc_max_port)?;

        let id = Uuid::new_v4().to_string();
        state.transports.insert(
            id.clone(),
            TransportState {
                router_id: router.id.clone(),
                kind: TransportKind::Plain,
                port,
                connected: true,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );
        if let Some(router_state) = state.routers.get_mut(&router.id) {
            router_state.transports.insert(id.clone());
        }

        Ok(PlainTransportInfo {
            id,
            ip: self.feed_ip(),
            port,
        })
    }

    async fn close(&self, handle: MediaHandle) {
        let mut state = self.state.lock();
        match &handle {
            MediaHandle::Router(id) => state.close_router(id),
            MediaHandle::Transport(id) => state.close_transport(id),
            MediaHandle::Producer(id) => state.close_producer(id),
            MediaHandle::Consumer(id) => state.close_consumer(id),
        }
        tracing::trace!(handle = ?handle, "Media handle closed");
    }

    fn subscribe_failures(&self) -> broadcast::Receiver<EngineFailure> {
        self.failures.subscribe()
    }

    async fn restart_worker(&self, worker_id: usize) -> Result<()> {
        let mut state = self.state.lock();
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SfuError::media(format!("worker {} does not exist", worker_id)))?;
        worker.alive = true;
        tracing::info!(worker_id = worker_id, "Media engine worker restarted");
        Ok(())
    }
}
