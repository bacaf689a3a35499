use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::RecordingStatus;

/// Retained record of one room recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub id: String,
    pub room_id: String,
    pub room_name: String,
    pub file_path: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: RecordingStatus,
    /// Peer ids present when the recording was started.
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl RecordingSession {
    pub fn starting(
        id: String,
        room_id: String,
        room_name: String,
        file_path: String,
        participants: Vec<String>,
    ) -> Self {
        Self {
            id,
            room_id,
            room_name,
            file_path,
            start_time: Utc::now(),
            end_time: None,
            status: RecordingStatus::Starting,
            participants,
            failure_reason: None,
            file_size: None,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = RecordingStatus::Failed;
        self.failure_reason = Some(reason.into());
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }
}
