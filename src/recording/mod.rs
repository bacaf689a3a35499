mod recorder;
mod session;
mod state;
mod transcoder;

#[cfg(feature = "gstreamer")]
mod pipeline;

use std::sync::Arc;

use crate::config::{RecordingBackend, RecordingConfig};
use crate::error::Result;

#[cfg(feature = "gstreamer")]
pub use pipeline::GstTranscoder;
pub use recorder::RecordingManager;
pub use session::RecordingSession;
pub use state::RecordingStatus;
pub use transcoder::{
    build_sdp, FeedStream, FfmpegTranscoder, TranscodeHandle, TranscodeOutcome, TranscodeRequest,
    Transcoder,
};

/// Transcoder selected by `RECORDING_BACKEND`.
pub fn transcoder_from_config(config: &RecordingConfig) -> Result<Arc<dyn Transcoder>> {
    match config.backend {
        RecordingBackend::Ffmpeg => Ok(Arc::new(FfmpegTranscoder::new(config))),
        #[cfg(feature = "gstreamer")]
        RecordingBackend::Gstreamer => Ok(Arc::new(GstTranscoder::new(config)?)),
        #[cfg(not(feature = "gstreamer"))]
        RecordingBackend::Gstreamer => Err(crate::error::SfuError::InvalidConfiguration(
            "RECORDING_BACKEND=gstreamer requires the gstreamer feature".to_string(),
        )),
    }
}
