use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Accepted, waiting for the transcoder to confirm.
    Starting,
    Recording,
    Stopped,
    Processing,
    Completed,
    Failed,
}

impl Default for RecordingStatus {
    fn default() -> Self {
        Self::Starting
    }
}

impl std::fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Starting => "starting",
            RecordingStatus::Recording => "recording",
            RecordingStatus::Stopped => "stopped",
            RecordingStatus::Processing => "processing",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Failed => "failed",
        }
    }

    /// No further transitions happen from here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordingStatus::Completed | RecordingStatus::Failed)
    }

    /// The transcoder may still be writing the file.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            RecordingStatus::Starting
                | RecordingStatus::Recording
                | RecordingStatus::Stopped
                | RecordingStatus::Processing
        )
    }
}
