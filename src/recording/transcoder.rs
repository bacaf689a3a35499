use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::{RecordingConfig, RecordingFormat};
use crate::error::{Result, SfuError};
use crate::media::codecs;
use crate::media::{MediaKind, RtpCodecParameters};

/// One RTP stream the engine forwards to the transcoder.
#[derive(Debug, Clone)]
pub struct FeedStream {
    pub kind: MediaKind,
    pub ip: IpAddr,
    pub port: u16,
    pub codec: RtpCodecParameters,
    pub ssrc: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub recording_id: String,
    pub sdp_path: PathBuf,
    pub output_path: PathBuf,
    pub format: RecordingFormat,
    pub streams: Vec<FeedStream>,
}

pub type TranscodeOutcome = std::result::Result<(), String>;

/// Control surface of a launched transcoding process.
#[derive(Debug)]
pub struct TranscodeHandle {
    /// Resolves once the process is consuming the feed.
    pub ready: oneshot::Receiver<TranscodeOutcome>,
    /// Requests a graceful finish. Dropping it has the same effect.
    pub stop: oneshot::Sender<()>,
    /// Resolves when the process has exited.
    pub done: oneshot::Receiver<TranscodeOutcome>,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Launches the process. Returns as soon as it runs; readiness and
    /// completion are reported through the handle.
    async fn start(&self, request: TranscodeRequest) -> Result<TranscodeHandle>;
}

fn encoding_name(mime_type: &str) -> &str {
    mime_type.split('/').nth(1).unwrap_or(mime_type)
}

/// SDP description of the feed, one media section per stream.
pub fn build_sdp(streams: &[FeedStream]) -> String {
    let origin_ip = streams
        .first()
        .map(|s| s.ip)
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o=- 0 0 IN {} {}\r\n", addr_type(&origin_ip), origin_ip));
    sdp.push_str("s=sfu-rooms recording\r\n");
    sdp.push_str("t=0 0\r\n");

    for stream in streams {
        let codec = &stream.codec;
        sdp.push_str(&format!(
            "m={} {} RTP/AVP {}\r\n",
            stream.kind, stream.port, codec.payload_type
        ));
        sdp.push_str(&format!("c=IN {} {}\r\n", addr_type(&stream.ip), stream.ip));
        let mut rtpmap = format!(
            "a=rtpmap:{} {}/{}",
            codec.payload_type,
            encoding_name(&codec.mime_type),
            codec.clock_rate
        );
        if let Some(channels) = codec.channels {
            rtpmap.push_str(&format!("/{}", channels));
        }
        sdp.push_str(&rtpmap);
        sdp.push_str("\r\n");
        if !codec.parameters.is_empty() {
            sdp.push_str(&format!(
                "a=fmtp:{} {}\r\n",
                codec.payload_type,
                codecs::format_fmtp(&codec.parameters)
            ));
        }
        sdp.push_str("a=recvonly\r\n");
    }
    sdp
}

fn addr_type(ip: &IpAddr) -> &'static str {
    if ip.is_ipv4() {
        "IP4"
    } else {
        "IP6"
    }
}

/// Drives an `ffmpeg` child process reading the SDP feed.
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    stop_timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(config: &RecordingConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            stop_timeout: config.stop_timeout,
        }
    }

    pub fn args(request: &TranscodeRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "info".into(),
            "-nostats".into(),
            "-protocol_whitelist".into(),
            "file,udp,rtp".into(),
            "-fflags".into(),
            "+genpts".into(),
            "-f".into(),
            "sdp".into(),
            "-i".into(),
            request.sdp_path.display().to_string(),
            "-map".into(),
            "0".into(),
        ];
        match request.format {
            RecordingFormat::Webm => {
                args.extend(["-c".into(), "copy".into(), "-f".into(), "webm".into()]);
            }
            RecordingFormat::Mp4 => {
                args.extend([
                    "-c:v".into(),
                    "libx264".into(),
                    "-preset".into(),
                    "veryfast".into(),
                    "-c:a".into(),
                    "aac".into(),
                    "-f".into(),
                    "mp4".into(),
                ]);
            }
        }
        args.push("-y".into());
        args.push(request.output_path.display().to_string());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn start(&self, request: TranscodeRequest) -> Result<TranscodeHandle> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(Self::args(&request))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SfuError::Transcoder(format!("failed to spawn {}: {}", self.ffmpeg_path, e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SfuError::Transcoder("ffmpeg stderr not captured".to_string()))?;
        let mut stdin = child.stdin.take();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();

        let stop_timeout = self.stop_timeout;
        let recording_id = request.recording_id.clone();
        tracing::info!(
            recording_id = %recording_id,
            pid = child.id().unwrap_or_default(),
            output = %request.output_path.display(),
            "ffmpeg launched"
        );

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut ready = Some(ready_tx);
            let mut stderr_open = true;
            let mut stop_requested = false;
            let mut killed = false;
            let kill_timer = tokio::time::sleep(stop_timeout);
            tokio::pin!(kill_timer);

            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    line = lines.next_line(), if stderr_open => match line {
                        Ok(Some(line)) => {
                            if line.trim_start().starts_with("Output #0") {
                                if let Some(tx) = ready.take() {
                                    let _ = tx.send(Ok(()));
                                }
                            }
                            tracing::trace!(recording_id = %recording_id, line = %line, "ffmpeg");
                        }
                        _ => stderr_open = false,
                    },
                    _ = &mut stop_rx, if !stop_requested => {
                        stop_requested = true;
                        kill_timer.as_mut().reset(Instant::now() + stop_timeout);
                        if let Some(mut pipe) = stdin.take() {
                            if let Err(e) = pipe.write_all(b"q\n").await {
                                tracing::warn!(recording_id = %recording_id, error = %e, "Failed to signal ffmpeg");
                            }
                        }
                    },
                    _ = &mut kill_timer, if stop_requested && !killed => {
                        killed = true;
                        tracing::warn!(recording_id = %recording_id, "ffmpeg ignored stop request, killing");
                        let _ = child.start_kill();
                    },
                }
            };

            let outcome = match status {
                Ok(_) if killed => Err("ffmpeg killed after stop timeout".to_string()),
                Ok(status) if stop_requested && status.success() => Ok(()),
                Ok(status) if stop_requested => Err(format!("ffmpeg exited with {}", status)),
                Ok(status) => Err(format!("ffmpeg exited unexpectedly with {}", status)),
                Err(e) => Err(format!("failed to wait for ffmpeg: {}", e)),
            };
            if let Some(tx) = ready.take() {
                let _ = tx.send(Err(outcome
                    .clone()
                    .err()
                    .unwrap_or_else(|| "ffmpeg exited before opening its output".to_string())));
            }
            tracing::info!(recording_id = %recording_id, outcome = ?outcome, "ffmpeg finished");
            let _ = done_tx.send(outcome);
        });

        Ok(TranscodeHandle {
            ready: ready_rx,
            stop: stop_tx,
            done: done_rx,
        })
    }
}
