//! Peer-side view of a room, driven by the signaling event stream.

mod reconciler;

pub use reconciler::{ClientReconciler, Participant, RemoteStream};
