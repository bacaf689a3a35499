use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use super::transcoder::{FeedStream, TranscodeHandle, TranscodeOutcome, TranscodeRequest, Transcoder};
use crate::config::{RecordingConfig, RecordingFormat};
use crate::error::{Result, SfuError};
use crate::media::MediaKind;

/// In-process GStreamer transcoder: one `udpsrc` branch per feed stream into a
/// shared muxer and `filesink`.
pub struct GstTranscoder {
    stop_timeout: Duration,
}

impl GstTranscoder {
    pub fn new(config: &RecordingConfig) -> Result<Self> {
        gst::init().map_err(|e| SfuError::Transcoder(format!("GStreamer init failed: {}", e)))?;
        Ok(Self {
            stop_timeout: config.stop_timeout,
        })
    }

    fn branch(stream: &FeedStream, format: RecordingFormat) -> String {
        let codec = &stream.codec;
        let encoding = codec
            .mime_type
            .split('/')
            .nth(1)
            .unwrap_or(&codec.mime_type)
            .to_ascii_uppercase();
        let caps = format!(
            "application/x-rtp,media={},encoding-name={},clock-rate={},payload={}",
            stream.kind, encoding, codec.clock_rate, codec.payload_type
        );
        let decode = match (stream.kind, format) {
            (MediaKind::Video, RecordingFormat::Webm) => "rtpvp8depay",
            (MediaKind::Audio, RecordingFormat::Webm) => "rtpopusdepay",
            (MediaKind::Video, RecordingFormat::Mp4) => {
                "rtpvp8depay ! vp8dec ! videoconvert ! x264enc tune=zerolatency"
            }
            (MediaKind::Audio, RecordingFormat::Mp4) => {
                "rtpopusdepay ! opusdec ! audioconvert ! avenc_aac"
            }
        };
        format!(
            "udpsrc address={} port={} caps=\"{}\" ! rtpjitterbuffer ! {} ! mux. ",
            stream.ip, stream.port, caps, decode
        )
    }

    pub fn describe(request: &TranscodeRequest) -> String {
        let muxer = match request.format {
            RecordingFormat::Webm => "webmmux",
            RecordingFormat::Mp4 => "mp4mux",
        };
        let mut description = format!(
            "{} name=mux ! filesink location=\"{}\" ",
            muxer,
            request.output_path.display()
        );
        for stream in &request.streams {
            description.push_str(&Self::branch(stream, request.format));
        }
        description
    }
}

fn watch_bus(
    pipeline: gst::Pipeline,
    ready: oneshot::Sender<TranscodeOutcome>,
    shutdown: Arc<AtomicBool>,
) -> TranscodeOutcome {
    let bus = pipeline
        .bus()
        .ok_or_else(|| "pipeline has no bus".to_string())?;
    let mut ready = Some(ready);

    while !shutdown.load(Ordering::Acquire) {
        let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
            continue;
        };
        match msg.view() {
            gst::MessageView::Eos(_) => return Ok(()),
            gst::MessageView::Error(err) => {
                let reason = format!("{} ({:?})", err.error(), err.debug());
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(reason.clone()));
                }
                return Err(reason);
            }
            gst::MessageView::StateChanged(changed) => {
                let from_pipeline = msg
                    .src()
                    .map(|src| src == pipeline.upcast_ref::<gst::Object>())
                    .unwrap_or(false);
                if from_pipeline && changed.current() == gst::State::Playing {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
            }
            _ => {}
        }
    }
    Err("pipeline shut down before end of stream".to_string())
}

#[async_trait]
impl Transcoder for GstTranscoder {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    async fn start(&self, request: TranscodeRequest) -> Result<TranscodeHandle> {
        let description = Self::describe(&request);
        let pipeline = gst::parse::launch(&description)
            .map_err(|e| SfuError::Transcoder(format!("Failed to build pipeline: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SfuError::Transcoder("Parsed element is not a pipeline".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SfuError::Transcoder(format!("Failed to start pipeline: {}", e)))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut watcher = {
            let pipeline = pipeline.clone();
            let shutdown = shutdown.clone();
            tokio::task::spawn_blocking(move || watch_bus(pipeline, ready_tx, shutdown))
        };

        let stop_timeout = self.stop_timeout;
        let recording_id = request.recording_id.clone();
        tracing::info!(
            recording_id = %recording_id,
            output = %request.output_path.display(),
            "Recording pipeline started"
        );

        tokio::spawn(async move {
            let joined = tokio::select! {
                joined = &mut watcher => Some(joined),
                _ = stop_rx => {
                    pipeline.send_event(gst::event::Eos::new());
                    tokio::time::timeout(stop_timeout, &mut watcher).await.ok()
                }
            };
            let outcome = match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(e)) => Err(format!("bus watcher panicked: {}", e)),
                None => Err("pipeline did not drain before stop timeout".to_string()),
            };
            shutdown.store(true, Ordering::Release);
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                tracing::warn!(recording_id = %recording_id, error = %e, "Failed to stop pipeline");
            }
            tracing::info!(recording_id = %recording_id, outcome = ?outcome, "Recording pipeline finished");
            let _ = done_tx.send(outcome);
        });

        Ok(TranscodeHandle {
            ready: ready_rx,
            stop: stop_tx,
            done: done_rx,
        })
    }
}
