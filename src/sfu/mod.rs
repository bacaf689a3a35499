pub mod connection;
pub mod peer;
pub mod room;
mod server;
pub mod signaling;

pub use connection::SfuConnection;
pub use room::{Room, RoomRegistry};
pub use server::{EngineHealth, SfuServer};
pub use signaling::{PeerSummary, ProducerSummary, RoomStats, SfuEvent, SfuRequest};
