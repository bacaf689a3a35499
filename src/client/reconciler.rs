use std::collections::{BTreeMap, HashSet};

use crate::media::MediaKind;
use crate::sfu::{PeerSummary, SfuEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub peer_id: String,
    pub peer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub peer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
}

/// Local view of a room built from the `joined` snapshot and the delta
/// stream that follows it.
///
/// Every merge is keyed by id, and removals leave a tombstone. Applying the
/// same set of events in any order therefore converges on the same view.
/// Streams announced for a peer that is not known yet wait in `pending` and
/// attach when that peer shows up.
#[derive(Debug, Default)]
pub struct ClientReconciler {
    local_id: Option<String>,
    room_id: Option<String>,
    recording_id: Option<String>,
    participants: BTreeMap<String, Participant>,
    streams: BTreeMap<String, RemoteStream>,
    pending: BTreeMap<String, RemoteStream>,
    departed: HashSet<String>,
    closed_producers: HashSet<String>,
}

impl ClientReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn active_recording(&self) -> Option<&str> {
        self.recording_id.as_deref()
    }

    /// Sets our own peer id and drops anything already recorded under it.
    pub fn set_local_identity(&mut self, peer_id: &str) -> bool {
        if self.local_id.as_deref() == Some(peer_id) {
            return false;
        }
        self.local_id = Some(peer_id.to_string());
        let mut changed = self.participants.remove(peer_id).is_some();
        let before = self.streams.len() + self.pending.len();
        self.streams.retain(|_, s| s.peer_id != peer_id);
        self.pending.retain(|_, s| s.peer_id != peer_id);
        changed |= before != self.streams.len() + self.pending.len();
        changed
    }

    fn is_local(&self, peer_id: &str) -> bool {
        self.local_id.as_deref() == Some(peer_id)
    }

    fn add_participant(&mut self, peer_id: &str, peer_name: &str) -> bool {
        if self.is_local(peer_id) || self.departed.contains(peer_id) {
            return false;
        }
        let inserted = self
            .participants
            .insert(
                peer_id.to_string(),
                Participant {
                    peer_id: peer_id.to_string(),
                    peer_name: peer_name.to_string(),
                },
            )
            .map(|old| old.peer_name != peer_name)
            .unwrap_or(true);

        let waiting: Vec<String> = self
            .pending
            .values()
            .filter(|s| s.peer_id == peer_id)
            .map(|s| s.producer_id.clone())
            .collect();
        let attached = !waiting.is_empty();
        for producer_id in waiting {
            if let Some(stream) = self.pending.remove(&producer_id) {
                self.streams.insert(producer_id, stream);
            }
        }
        inserted || attached
    }

    fn add_stream(&mut self, peer_id: &str, producer_id: &str, kind: MediaKind) -> bool {
        if self.is_local(peer_id)
            || self.departed.contains(peer_id)
            || self.closed_producers.contains(producer_id)
            || self.streams.contains_key(producer_id)
        {
            return false;
        }
        let stream = RemoteStream {
            peer_id: peer_id.to_string(),
            producer_id: producer_id.to_string(),
            kind,
        };
        if self.participants.contains_key(peer_id) {
            self.streams.insert(producer_id.to_string(), stream);
            true
        } else {
            self.pending.insert(producer_id.to_string(), stream).is_none()
        }
    }

    fn remove_participant(&mut self, peer_id: &str) -> bool {
        self.departed.insert(peer_id.to_string());
        let mut changed = self.participants.remove(peer_id).is_some();
        let before = self.streams.len() + self.pending.len();
        self.streams.retain(|_, s| s.peer_id != peer_id);
        self.pending.retain(|_, s| s.peer_id != peer_id);
        changed |= before != self.streams.len() + self.pending.len();
        changed
    }

    fn remove_stream(&mut self, producer_id: &str) -> bool {
        self.closed_producers.insert(producer_id.to_string());
        self.streams.remove(producer_id).is_some() | self.pending.remove(producer_id).is_some()
    }

    /// Merges the peer list delivered with `joined`.
    pub fn apply_snapshot(&mut self, peers: &[PeerSummary]) -> bool {
        let mut changed = false;
        for peer in peers {
            changed |= self.add_participant(&peer.peer_id, &peer.peer_name);
            for producer in &peer.producers {
                changed |= self.add_stream(&peer.peer_id, &producer.producer_id, producer.kind);
            }
        }
        changed
    }

    fn clear(&mut self) {
        self.room_id = None;
        self.recording_id = None;
        self.participants.clear();
        self.streams.clear();
        self.pending.clear();
        self.departed.clear();
        self.closed_producers.clear();
    }

    /// Applies one server event. Returns whether the view changed; events
    /// that carry no room state are ignored.
    pub fn apply_event(&mut self, event: &SfuEvent) -> bool {
        match event {
            SfuEvent::Joined {
                peer_id,
                room_id,
                is_recording,
                recording_id,
                peers,
                ..
            } => {
                let mut changed = self.set_local_identity(peer_id);
                if self.room_id.as_deref() != Some(room_id) {
                    self.room_id = Some(room_id.clone());
                    changed = true;
                }
                let recording = if *is_recording {
                    recording_id.clone().or_else(|| self.recording_id.clone())
                } else {
                    None
                };
                if self.recording_id != recording {
                    self.recording_id = recording;
                    changed = true;
                }
                changed | self.apply_snapshot(peers)
            }
            SfuEvent::PeerJoined { peer_id, peer_name } => self.add_participant(peer_id, peer_name),
            SfuEvent::PeerLeft { peer_id } => self.remove_participant(peer_id),
            SfuEvent::NewProducer {
                peer_id,
                producer_id,
                kind,
            } => self.add_stream(peer_id, producer_id, *kind),
            SfuEvent::ProducerClosed { producer_id, .. } => self.remove_stream(producer_id),
            SfuEvent::RecordingStarted { recording_id, .. } => {
                self.recording_id.replace(recording_id.clone()).as_ref() != Some(recording_id)
            }
            SfuEvent::RecordingStopped { recording_id, .. }
            | SfuEvent::RecordingFailed { recording_id, .. } => {
                if self.recording_id.as_ref() == Some(recording_id) {
                    self.recording_id = None;
                    true
                } else {
                    false
                }
            }
            SfuEvent::Left { .. } | SfuEvent::RoomClosed { .. } => {
                let changed = self.room_id.is_some() || !self.participants.is_empty();
                self.clear();
                changed
            }
            _ => false,
        }
    }

    /// Known remote participants, ordered by peer id.
    pub fn participants(&self) -> Vec<&Participant> {
        self.participants.values().collect()
    }

    pub fn participant(&self, peer_id: &str) -> Option<&Participant> {
        self.participants.get(peer_id)
    }

    /// Streams attached to known participants, ordered by producer id.
    pub fn streams(&self) -> Vec<&RemoteStream> {
        self.streams.values().collect()
    }

    pub fn streams_of(&self, peer_id: &str) -> Vec<&RemoteStream> {
        self.streams.values().filter(|s| s.peer_id == peer_id).collect()
    }

    /// Streams still waiting for their owner to be announced.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::RtpCapabilities;
    use crate::sfu::ProducerSummary;

    fn joined(local: &str, peers: Vec<PeerSummary>) -> SfuEvent {
        SfuEvent::Joined {
            peer_id: local.to_string(),
            room_id: "room-1".to_string(),
            router_rtp_capabilities: RtpCapabilities::default(),
            is_recording: false,
            recording_id: None,
            peers,
        }
    }

    fn peer_joined(id: &str) -> SfuEvent {
        SfuEvent::PeerJoined {
            peer_id: id.to_string(),
            peer_name: format!("name-{}", id),
        }
    }

    fn new_producer(peer: &str, producer: &str) -> SfuEvent {
        SfuEvent::NewProducer {
            peer_id: peer.to_string(),
            producer_id: producer.to_string(),
            kind: MediaKind::Video,
        }
    }

    fn peer_left(id: &str) -> SfuEvent {
        SfuEvent::PeerLeft {
            peer_id: id.to_string(),
        }
    }

    fn summary(id: &str, producers: &[&str]) -> PeerSummary {
        PeerSummary {
            peer_id: id.to_string(),
            peer_name: format!("name-{}", id),
            producers: producers
                .iter()
                .map(|p| ProducerSummary {
                    producer_id: p.to_string(),
                    kind: MediaKind::Video,
                })
                .collect(),
        }
    }

    fn permutations(events: &[SfuEvent]) -> Vec<Vec<SfuEvent>> {
        if events.len() <= 1 {
            return vec![events.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..events.len() {
            let mut rest = events.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    fn view(reconciler: &ClientReconciler) -> (Vec<String>, Vec<String>, usize) {
        (
            reconciler.participants().iter().map(|p| p.peer_id.clone()).collect(),
            reconciler.streams().iter().map(|s| s.producer_id.clone()).collect(),
            reconciler.pending_count(),
        )
    }

    #[test]
    fn test_duplicate_peer_joined_is_idempotent() {
        let mut reconciler = ClientReconciler::new();
        reconciler.apply_event(&joined("me", vec![]));

        assert!(reconciler.apply_event(&peer_joined("pB")));
        assert!(!reconciler.apply_event(&peer_joined("pB")));
        assert_eq!(reconciler.participants().len(), 1);
    }

    #[test]
    fn test_local_identity_never_listed_in_any_order() {
        let events = vec![
            joined("me", vec![summary("pA", &["p1"])]),
            peer_joined("me"),
            new_producer("me", "p-own"),
            peer_joined("pB"),
        ];

        for order in permutations(&events) {
            let mut reconciler = ClientReconciler::new();
            for event in &order {
                reconciler.apply_event(event);
            }
            assert!(reconciler.participant("me").is_none(), "order: {:?}", order);
            assert!(reconciler.streams_of("me").is_empty());
            assert_eq!(
                view(&reconciler),
                (vec!["pA".to_string(), "pB".to_string()], vec!["p1".to_string()], 0)
            );
        }
    }

    #[test]
    fn test_stream_for_unknown_peer_waits_for_it() {
        let mut reconciler = ClientReconciler::new();
        reconciler.set_local_identity("me");

        assert!(reconciler.apply_event(&new_producer("pB", "p2")));
        assert!(reconciler.participant("pB").is_none());
        assert!(reconciler.streams().is_empty());
        assert_eq!(reconciler.pending_count(), 1);

        assert!(reconciler.apply_event(&peer_joined("pB")));
        assert_eq!(reconciler.pending_count(), 0);
        assert_eq!(reconciler.streams_of("pB").len(), 1);
    }

    #[test]
    fn test_departure_removes_peer_and_streams_in_any_order() {
        let events = vec![
            peer_joined("pB"),
            new_producer("pB", "p2"),
            new_producer("pB", "p3"),
            peer_left("pB"),
            peer_joined("pC"),
        ];

        for order in permutations(&events) {
            let mut reconciler = ClientReconciler::new();
            reconciler.set_local_identity("me");
            for event in &order {
                reconciler.apply_event(event);
            }
            assert_eq!(
                view(&reconciler),
                (vec!["pC".to_string()], vec![], 0),
                "order: {:?}",
                order
            );
        }
    }

    #[test]
    fn test_producer_closed_removes_stream() {
        let mut reconciler = ClientReconciler::new();
        reconciler.apply_event(&joined("me", vec![summary("pA", &["p1", "p2"])]));
        assert_eq!(reconciler.streams().len(), 2);

        let closed = SfuEvent::ProducerClosed {
            peer_id: "pA".to_string(),
            producer_id: "p1".to_string(),
        };
        assert!(reconciler.apply_event(&closed));
        assert!(!reconciler.apply_event(&new_producer("pA", "p1")));
        assert_eq!(reconciler.streams().len(), 1);
        assert_eq!(reconciler.participants().len(), 1);
    }

    #[test]
    fn test_room_closed_clears_view() {
        let mut reconciler = ClientReconciler::new();
        reconciler.apply_event(&joined("me", vec![summary("pA", &["p1"])]));
        reconciler.apply_event(&SfuEvent::RecordingStarted {
            recording_id: "rec".to_string(),
            start_time: chrono::Utc::now(),
        });
        assert_eq!(reconciler.active_recording(), Some("rec"));

        assert!(reconciler.apply_event(&SfuEvent::RoomClosed {
            room_id: "room-1".to_string(),
            reason: "media worker 0 failed".to_string(),
        }));
        assert!(reconciler.participants().is_empty());
        assert!(reconciler.streams().is_empty());
        assert!(reconciler.room_id().is_none());
        assert!(reconciler.active_recording().is_none());
        assert_eq!(reconciler.local_id(), Some("me"));
    }

    #[test]
    fn test_joined_during_recording_reports_it() {
        let mut reconciler = ClientReconciler::new();
        reconciler.apply_event(&SfuEvent::Joined {
            peer_id: "me".to_string(),
            room_id: "room-1".to_string(),
            router_rtp_capabilities: RtpCapabilities::default(),
            is_recording: true,
            recording_id: Some("rec-7".to_string()),
            peers: vec![summary("pA", &[])],
        });
        assert_eq!(reconciler.active_recording(), Some("rec-7"));

        assert!(reconciler.apply_event(&SfuEvent::RecordingStopped {
            recording_id: "rec-7".to_string(),
            end_time: chrono::Utc::now(),
            file_path: "recordings/rec-7.webm".to_string(),
        }));
        assert!(reconciler.active_recording().is_none());
    }

    #[test]
    fn test_unrelated_events_ignored() {
        let mut reconciler = ClientReconciler::new();
        assert!(!reconciler.apply_event(&SfuEvent::ConsumerResumed {
            consumer_id: "c1".to_string(),
        }));
    }
}
