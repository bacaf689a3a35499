use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::signaling::{PeerStats, PeerSummary, ProducerSummary, SfuEvent, TransportState, TransportStats};
use crate::media::{MediaHandle, MediaKind, TransportDirection};

/// Outbound half of a client connection.
pub type EventSender = mpsc::UnboundedSender<SfuEvent>;

#[derive(Debug, Clone)]
pub struct Transport {
    pub id: String,
    pub direction: TransportDirection,
    pub state: TransportState,
}

#[derive(Debug, Clone)]
pub struct Producer {
    pub id: String,
    pub kind: MediaKind,
    pub transport_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Paused,
    Active,
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: String,
    pub kind: MediaKind,
    pub producer_id: String,
    pub transport_id: String,
    pub state: ConsumerState,
}

/// Room-scoped state of one connected peer.
///
/// Owns the peer's transports, producers and consumers; whoever removes the
/// session is responsible for closing [`PeerSession::owned_handles`].
#[derive(Debug)]
pub struct PeerSession {
    pub id: String,
    pub name: String,
    pub joined_at: DateTime<Utc>,
    sender: EventSender,
    pub transports: HashMap<TransportDirection, Transport>,
    pub producers: HashMap<String, Producer>,
    pub consumers: HashMap<String, Consumer>,
}

impl PeerSession {
    pub fn new(id: String, name: String, sender: EventSender) -> Self {
        Self {
            id,
            name,
            joined_at: Utc::now(),
            sender,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Queues an event for this peer. A closed connection just drops it.
    pub fn send(&self, event: SfuEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!(peer_id = %self.id, "Dropping event for closed connection");
        }
    }

    pub fn transport_by_id(&self, transport_id: &str) -> Option<&Transport> {
        self.transports.values().find(|t| t.id == transport_id)
    }

    pub fn transport_by_id_mut(&mut self, transport_id: &str) -> Option<&mut Transport> {
        self.transports.values_mut().find(|t| t.id == transport_id)
    }

    pub fn active_producer(&self, kind: MediaKind) -> Option<&Producer> {
        self.producers.values().find(|p| p.kind == kind)
    }

    /// Consumers fed by `producer_id`.
    pub fn consumers_of(&self, producer_id: &str) -> Vec<String> {
        self.consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.id.clone(),
            peer_name: self.name.clone(),
            producers: self.producer_summaries(),
        }
    }

    pub fn stats(&self) -> PeerStats {
        let mut transports: Vec<TransportStats> = self
            .transports
            .values()
            .map(|t| TransportStats {
                transport_id: t.id.clone(),
                direction: t.direction,
                state: t.state,
            })
            .collect();
        transports.sort_by_key(|t| t.direction == TransportDirection::Recv);

        PeerStats {
            peer_id: self.id.clone(),
            peer_name: self.name.clone(),
            joined_at: self.joined_at,
            transports,
            producers: self.producer_summaries(),
            consumers: self.consumers.len(),
        }
    }

    fn producer_summaries(&self) -> Vec<ProducerSummary> {
        let mut producers: Vec<ProducerSummary> = self
            .producers
            .values()
            .map(|p| ProducerSummary {
                producer_id: p.id.clone(),
                kind: p.kind,
            })
            .collect();
        producers.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        producers
    }

    /// Consumers first, then producers, then transports.
    pub fn owned_handles(&self) -> Vec<MediaHandle> {
        self.consumers
            .keys()
            .map(|id| MediaHandle::Consumer(id.clone()))
            .chain(self.producers.keys().map(|id| MediaHandle::Producer(id.clone())))
            .chain(self.transports.values().map(|t| MediaHandle::Transport(t.id.clone())))
            .collect()
    }
}
