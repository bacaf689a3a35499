use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::session::RecordingSession;
use super::state::RecordingStatus;
use super::transcoder::{FeedStream, TranscodeOutcome, TranscodeRequest, Transcoder};
use crate::config::RecordingConfig;
use crate::error::{Result, SfuError};
use crate::media::{with_timeout, MediaEngine, MediaHandle, MediaKind};
use crate::sfu::room::{Room, RoomRecording};
use crate::sfu::signaling::SfuEvent;

/// Feed and control channel of a recording that is writing.
struct ActiveJob {
    room_id: String,
    stop: Option<oneshot::Sender<()>>,
    feed: Vec<MediaHandle>,
}

/// Transcoder launched on a live feed, not yet committed to the room.
struct Launch {
    stop: oneshot::Sender<()>,
    done: oneshot::Receiver<TranscodeOutcome>,
    feed: Vec<MediaHandle>,
}

/// Per-room recording lifecycle.
///
/// The room's `recording` slot is the per-room mutex: a start reserves it under
/// the room lock before any engine or transcoder work happens. Stops are
/// serialized through the job table.
pub struct RecordingManager {
    config: RecordingConfig,
    engine: Arc<dyn MediaEngine>,
    transcoder: Arc<dyn Transcoder>,
    engine_timeout: Duration,
    sessions: RwLock<HashMap<String, RecordingSession>>,
    jobs: Mutex<HashMap<String, ActiveJob>>,
}

impl RecordingManager {
    pub fn new(
        config: RecordingConfig,
        engine: Arc<dyn MediaEngine>,
        transcoder: Arc<dyn Transcoder>,
        engine_timeout: Duration,
    ) -> Self {
        if config.enabled {
            if let Err(e) = std::fs::create_dir_all(&config.output_dir) {
                tracing::warn!(
                    output_dir = %config.output_dir.display(),
                    error = %e,
                    "Failed to create recording output directory"
                );
            }
        }
        tracing::info!(
            enabled = config.enabled,
            transcoder = transcoder.name(),
            output_dir = %config.output_dir.display(),
            "Recording manager initialized"
        );

        Self {
            config,
            engine,
            transcoder,
            engine_timeout,
            sessions: RwLock::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// `{output_dir}/{room_name}/{recording_id}.{ext}`, room name sanitized.
    fn output_path(&self, room_name: &str, recording_id: &str) -> PathBuf {
        let dir: String = room_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.config
            .output_dir
            .join(if dir.is_empty() { "_" } else { dir.as_str() })
            .join(format!("{}.{}", recording_id, self.config.format.extension()))
    }

    /// Starts recording the room. Resolves once the transcoder confirms;
    /// everyone in the room receives `recordingStarted`.
    pub async fn start(self: &Arc<Self>, room: &Arc<Room>) -> Result<RecordingSession> {
        if !self.config.enabled {
            return Err(SfuError::RecordingDisabled);
        }

        let recording_id = Uuid::new_v4().to_string();
        let (sources, participants) = {
            let mut state = room.lock().await;
            if room.is_closed() {
                return Err(SfuError::RoomClosed(room.id.clone()));
            }
            if let Some(current) = &state.recording {
                return Err(SfuError::RecordingAlreadyActive(current.id.clone()));
            }
            state.recording = Some(RoomRecording {
                id: recording_id.clone(),
                active: false,
            });

            let mut participants: Vec<String> = state.peers.keys().cloned().collect();
            participants.sort();
            let sources: Vec<(String, MediaKind)> = state
                .peers
                .values()
                .flat_map(|peer| peer.producers.values().map(|p| (p.id.clone(), p.kind)))
                .collect();
            (sources, participants)
        };

        let output_path = self.output_path(&room.name, &recording_id);
        let session = RecordingSession::starting(
            recording_id.clone(),
            room.id.clone(),
            room.name.clone(),
            output_path.display().to_string(),
            participants,
        );
        self.sessions.write().insert(recording_id.clone(), session);
        tracing::info!(
            room_id = %room.id,
            recording_id = %recording_id,
            streams = sources.len(),
            "Starting recording"
        );

        let launch = match self.launch(room, &recording_id, &sources, &output_path).await {
            Ok(launch) => launch,
            Err(e) => {
                {
                    let mut state = room.lock().await;
                    if state.recording.as_ref().map(|r| r.id == recording_id).unwrap_or(false) {
                        state.recording = None;
                    }
                }
                self.mark_failed(&recording_id, e.to_string());
                return Err(e);
            }
        };

        let mut state = room.lock().await;
        let still_reserved = !room.is_closed()
            && state.recording.as_ref().map(|r| r.id == recording_id).unwrap_or(false);
        if !still_reserved {
            drop(state);
            let _ = launch.stop.send(());
            self.close_feed(launch.feed).await;
            self.mark_failed(&recording_id, "room closed before recording started");
            return Err(SfuError::RoomClosed(room.id.clone()));
        }
        if let Some(reservation) = state.recording.as_mut() {
            reservation.active = true;
        }

        let start_time = Utc::now();
        let session = self
            .update(&recording_id, |s| {
                s.status = RecordingStatus::Recording;
                s.start_time = start_time;
            })
            .ok_or_else(|| SfuError::RecordingNotFound(recording_id.clone()))?;
        self.jobs.lock().insert(
            recording_id.clone(),
            ActiveJob {
                room_id: room.id.clone(),
                stop: Some(launch.stop),
                feed: launch.feed,
            },
        );
        state.broadcast(
            &SfuEvent::RecordingStarted {
                recording_id: recording_id.clone(),
                start_time,
            },
            None,
        );
        drop(state);

        tokio::spawn(self.clone().watch(room.clone(), recording_id.clone(), launch.done));
        tracing::info!(
            room_id = %room.id,
            recording_id = %recording_id,
            file = %session.file_path,
            "Recording started"
        );
        Ok(session)
    }

    /// Builds the server-side feed, starts the transcoder on it and waits for
    /// confirmation. Everything acquired is released on failure.
    async fn launch(
        &self,
        room: &Room,
        recording_id: &str,
        sources: &[(String, MediaKind)],
        output_path: &Path,
    ) -> Result<Launch> {
        if let Some(dir) = output_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut feed = Vec::new();
        let mut consumers = Vec::new();
        let mut streams = Vec::new();
        for (producer_id, kind) in sources {
            match self.open_stream(room, producer_id, *kind, &mut feed).await {
                Ok((consumer_id, stream)) => {
                    consumers.push(consumer_id);
                    streams.push(stream);
                }
                Err(e) => {
                    self.close_feed(feed).await;
                    return Err(e);
                }
            }
        }

        let sdp_path = output_path.with_extension("sdp");
        let request = TranscodeRequest {
            recording_id: recording_id.to_string(),
            sdp_path: sdp_path.clone(),
            output_path: output_path.to_path_buf(),
            format: self.config.format,
            streams,
        };
        let sdp = super::transcoder::build_sdp(&request.streams);
        if let Err(e) = tokio::fs::write(&sdp_path, sdp).await {
            self.close_feed(feed).await;
            return Err(e.into());
        }

        let handle = match self.transcoder.start(request).await {
            Ok(handle) => handle,
            Err(e) => {
                self.close_feed(feed).await;
                return Err(e);
            }
        };

        for consumer_id in &consumers {
            let resumed = with_timeout(
                self.engine_timeout,
                "resumeConsumer",
                self.engine.resume_consumer(consumer_id),
            )
            .await;
            if let Err(e) = resumed {
                let _ = handle.stop.send(());
                self.close_feed(feed).await;
                return Err(e);
            }
        }

        let confirmed = match tokio::time::timeout(self.config.start_timeout, handle.ready).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(SfuError::Transcoder(reason)),
            Ok(Err(_)) => Err(SfuError::Transcoder("transcoder exited before confirming".to_string())),
            Err(_) => Err(SfuError::Timeout(format!(
                "{} did not confirm within {:?}",
                self.transcoder.name(),
                self.config.start_timeout
            ))),
        };
        if let Err(e) = confirmed {
            let _ = handle.stop.send(());
            self.close_feed(feed).await;
            return Err(e);
        }

        Ok(Launch {
            stop: handle.stop,
            done: handle.done,
            feed,
        })
    }

    async fn open_stream(
        &self,
        room: &Room,
        producer_id: &str,
        kind: MediaKind,
        feed: &mut Vec<MediaHandle>,
    ) -> Result<(String, FeedStream)> {
        let plain = with_timeout(
            self.engine_timeout,
            "createPlainTransport",
            self.engine.create_plain_transport(&room.router),
        )
        .await?;
        feed.push(MediaHandle::Transport(plain.id.clone()));

        let consumer = with_timeout(
            self.engine_timeout,
            "consume",
            self.engine.consume(&plain.id, producer_id, &room.rtp_capabilities),
        )
        .await?;
        let codec = consumer
            .rtp_parameters
            .codecs
            .first()
            .cloned()
            .ok_or_else(|| SfuError::UnsupportedCodec(format!("producer {} has no codec", producer_id)))?;

        Ok((
            consumer.id,
            FeedStream {
                kind,
                ip: plain.ip,
                port: plain.port,
                codec,
                ssrc: consumer.rtp_parameters.encodings.first().and_then(|e| e.ssrc),
            },
        ))
    }

    async fn close_feed(&self, feed: Vec<MediaHandle>) {
        for handle in feed {
            self.engine.close(handle).await;
        }
    }

    /// Stops an active recording of `room`. Fails without touching the record
    /// unless the recording is currently writing.
    pub async fn stop(&self, room: &Room, recording_id: &str) -> Result<RecordingSession> {
        let mut state = room.lock().await;
        let belongs = self
            .sessions
            .read()
            .get(recording_id)
            .map(|s| s.room_id == room.id)
            .unwrap_or(false);
        if !belongs {
            return Err(SfuError::RecordingNotFound(recording_id.to_string()));
        }
        let job = self
            .take_job(recording_id)
            .ok_or_else(|| SfuError::RecordingNotActive(recording_id.to_string()))?;

        let end_time = Utc::now();
        let session = self
            .update(recording_id, |s| {
                s.status = RecordingStatus::Stopped;
                s.end_time = Some(end_time);
            })
            .ok_or_else(|| SfuError::RecordingNotFound(recording_id.to_string()))?;
        if state.recording.as_ref().map(|r| r.id == recording_id).unwrap_or(false) {
            state.recording = None;
        }
        state.broadcast(
            &SfuEvent::RecordingStopped {
                recording_id: recording_id.to_string(),
                end_time,
                file_path: session.file_path.clone(),
            },
            None,
        );
        drop(state);

        self.finish(job).await;
        tracing::info!(room_id = %room.id, recording_id = %recording_id, "Recording stopped");
        Ok(session)
    }

    fn take_job(&self, recording_id: &str) -> Option<ActiveJob> {
        self.jobs.lock().remove(recording_id)
    }

    async fn finish(&self, mut job: ActiveJob) {
        if let Some(stop) = job.stop.take() {
            let _ = stop.send(());
        }
        self.close_feed(std::mem::take(&mut job.feed)).await;
    }

    /// Deletes a recording and its file. A recording still writing is stopped
    /// first; `room` is where the stop gets announced, if it still exists.
    pub async fn delete(&self, room: Option<&Room>, recording_id: &str) -> Result<RecordingSession> {
        let status = self
            .get(recording_id)
            .map(|s| s.status)
            .ok_or_else(|| SfuError::RecordingNotFound(recording_id.to_string()))?;

        match status {
            RecordingStatus::Starting => {
                return Err(SfuError::RecordingAlreadyActive(recording_id.to_string()));
            }
            RecordingStatus::Recording => match room {
                Some(room) => {
                    self.stop(room, recording_id).await?;
                }
                None => {
                    if let Some(job) = self.take_job(recording_id) {
                        self.update(recording_id, |s| {
                            s.status = RecordingStatus::Stopped;
                            s.end_time = Some(Utc::now());
                        });
                        self.finish(job).await;
                    }
                }
            },
            _ => {}
        }

        let session = self
            .sessions
            .write()
            .remove(recording_id)
            .ok_or_else(|| SfuError::RecordingNotFound(recording_id.to_string()))?;
        remove_artifacts(Path::new(&session.file_path)).await;
        tracing::info!(recording_id = %recording_id, file = %session.file_path, "Recording deleted");
        Ok(session)
    }

    /// Called after a room is torn down with its reservation. A recording
    /// still starting notices on its own; an active one is stopped, or marked
    /// failed when the teardown came from an engine failure.
    pub async fn on_room_closed(&self, room_id: &str, recording: Option<RoomRecording>, failure: Option<&str>) {
        let Some(recording) = recording else {
            return;
        };
        if !recording.active {
            tracing::info!(room_id = %room_id, recording_id = %recording.id, "Recording cancelled before start");
            return;
        }
        let Some(job) = self.take_job(&recording.id) else {
            return;
        };

        match failure {
            Some(reason) => {
                self.update(&recording.id, |s| s.fail(reason));
                tracing::warn!(room_id = %room_id, recording_id = %recording.id, reason = %reason, "Recording failed with its room");
            }
            None => {
                self.update(&recording.id, |s| {
                    s.status = RecordingStatus::Stopped;
                    s.end_time = Some(Utc::now());
                });
                tracing::info!(room_id = %room_id, recording_id = %recording.id, "Recording stopped (room closed)");
            }
        }
        self.finish(job).await;
    }

    /// Follows the transcoder to completion.
    async fn watch(
        self: Arc<Self>,
        room: Arc<Room>,
        recording_id: String,
        done: oneshot::Receiver<TranscodeOutcome>,
    ) {
        let outcome = done
            .await
            .unwrap_or_else(|_| Err("transcoder vanished".to_string()));

        let Some(session) = self.get(&recording_id) else {
            // Deleted while the transcoder was finishing.
            remove_artifacts(Path::new(&self.output_path(&room.name, &recording_id))).await;
            return;
        };

        match session.status {
            RecordingStatus::Stopped => {
                self.update(&recording_id, |s| s.status = RecordingStatus::Processing);
                let verified = match outcome {
                    Ok(()) => verify_output(Path::new(&session.file_path)).await,
                    Err(reason) => Err(reason),
                };
                match verified {
                    Ok(size) => {
                        self.update(&recording_id, |s| {
                            s.status = RecordingStatus::Completed;
                            s.file_size = Some(size);
                        });
                        tracing::info!(recording_id = %recording_id, bytes = size, "Recording completed");
                    }
                    Err(reason) => {
                        tracing::error!(recording_id = %recording_id, reason = %reason, "Recording failed after stop");
                        self.update(&recording_id, |s| s.fail(reason));
                    }
                }
            }
            RecordingStatus::Recording => {
                let reason = match outcome {
                    Ok(()) => "transcoder finished without a stop request".to_string(),
                    Err(reason) => reason,
                };
                tracing::error!(recording_id = %recording_id, reason = %reason, "Recording failed");
                if let Some(job) = self.take_job(&recording_id) {
                    self.finish(job).await;
                }
                self.update(&recording_id, |s| s.fail(reason.clone()));

                let mut state = room.lock().await;
                if state.recording.as_ref().map(|r| r.id == recording_id).unwrap_or(false) {
                    state.recording = None;
                }
                state.broadcast(&SfuEvent::RecordingFailed { recording_id, reason }, None);
            }
            _ => {}
        }
    }

    fn update<F>(&self, recording_id: &str, apply: F) -> Option<RecordingSession>
    where
        F: FnOnce(&mut RecordingSession),
    {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(recording_id)?;
        apply(session);
        Some(session.clone())
    }

    fn mark_failed(&self, recording_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(recording_id = %recording_id, reason = %reason, "Recording failed to start");
        self.update(recording_id, |s| s.fail(reason));
    }

    pub fn get(&self, recording_id: &str) -> Option<RecordingSession> {
        self.sessions.read().get(recording_id).cloned()
    }

    /// Recordings made in rooms called `room_name`, oldest first.
    pub fn list_for_room(&self, room_name: &str) -> Vec<RecordingSession> {
        let mut list: Vec<RecordingSession> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.room_name == room_name)
            .cloned()
            .collect();
        list.sort_by_key(|s| s.start_time);
        list
    }

    pub fn list_all(&self) -> Vec<RecordingSession> {
        let mut list: Vec<RecordingSession> = self.sessions.read().values().cloned().collect();
        list.sort_by_key(|s| s.start_time);
        list
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Stops every writing recording and waits for the transcoders to
    /// finalize, bounded by the stop timeout.
    pub async fn shutdown(&self) {
        let jobs: Vec<(String, ActiveJob)> = self.jobs.lock().drain().collect();
        for (recording_id, job) in jobs {
            self.update(&recording_id, |s| {
                s.status = RecordingStatus::Stopped;
                s.end_time = Some(Utc::now());
            });
            tracing::info!(recording_id = %recording_id, room_id = %job.room_id, "Stopping recording for shutdown");
            self.finish(job).await;
        }

        let deadline = tokio::time::Instant::now() + self.config.stop_timeout;
        while tokio::time::Instant::now() < deadline {
            let pending = self
                .sessions
                .read()
                .values()
                .any(|s| matches!(s.status, RecordingStatus::Stopped | RecordingStatus::Processing));
            if !pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn verify_output(path: &Path) -> std::result::Result<u64, String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(meta.len()),
        Ok(_) => Err(format!("{} is empty", path.display())),
        Err(e) => Err(format!("{} missing: {}", path.display(), e)),
    }
}

async fn remove_artifacts(path: &Path) {
    for file in [path.to_path_buf(), path.with_extension("sdp")] {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(file = %file.display(), error = %e, "Failed to remove recording artifact"),
        }
    }
}
