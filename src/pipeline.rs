//! Pipeline task loops
//!
//! Five cooperating loops move media between the devices and the remote
//! session: capture-audio and capture-video feed the outbound queue,
//! send-to-remote drains it, receive-from-remote fills the inbound
//! queue, playback-audio drains that. Every loop checks the shared
//! cancellation token at each iteration boundary and at every blocking
//! await, and blocking device I/O is pushed onto the blocking pool so
//! the scheduler never stalls.
//!
//! A task returning `Ok(())` ended cooperatively or hit a task-local
//! fault (camera gone, playback device lost). A task returning `Err`
//! carries an unrecoverable fault; the supervising controller cancels
//! its siblings and fails the session.

use crate::events::{MediaChunk, Transcript, VideoMode, CHUNK_SAMPLES};
use crate::media::{AudioSink, AudioSource, DeviceError, FrameSource};
use crate::queue::BoundedQueue;
use crate::remote::{RemoteError, RemoteSession, ServerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound queue capacity: small and fixed so a slow network applies
/// backpressure to capture instead of growing memory.
pub const OUTBOUND_CAPACITY: usize = 5;
/// One video frame per second.
pub const FRAME_INTERVAL: Duration = Duration::from_secs(1);
/// Pause before retrying after a transient remote fault.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Unrecoverable pipeline fault; fails the whole session.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Microphone failure is fatal: audio is the primary channel.
    #[error("audio capture failed: {0}")]
    AudioCapture(DeviceError),

    #[error("remote stream failed: {0}")]
    Remote(RemoteError),

    #[error("pipeline task panicked: {0}")]
    Join(String),
}

/// Read fixed-size PCM frames from the microphone and push them onto
/// the outbound queue (the backpressure point). The pause gate is
/// checked before every device read, so a paused session holds the task
/// here without touching the device mid-read.
pub async fn capture_audio(
    mut mic: Box<dyn AudioSource>,
    outbound: Arc<BoundedQueue<MediaChunk>>,
    cancel: CancellationToken,
    mut pause: watch::Receiver<bool>,
) -> Result<(), PipelineError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        while *pause.borrow() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = pause.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        // The blocking read is awaited to completion so the device is
        // always back in this task's hands before it can exit; a device
        // read is short, so cancellation still lands at the next
        // iteration boundary.
        let (result, returned_mic, buf) = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; CHUNK_SAMPLES * 2];
            let result = mic.read(&mut buf);
            (result, mic, buf)
        })
        .await
        .map_err(|e| PipelineError::Join(e.to_string()))?;
        mic = returned_mic;

        if cancel.is_cancelled() {
            return Ok(());
        }

        if let Err(e) = result {
            return Err(PipelineError::AudioCapture(e));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = outbound.put(MediaChunk::audio(buf)) => {}
        }
    }
}

/// Capture one encoded frame per interval and push it outbound.
///
/// Failure policy differs by source: a camera fault ends this task only
/// (the session continues audio-only), a screen fault is retried on the
/// next tick.
pub async fn capture_video(
    mut frames: Box<dyn FrameSource>,
    mode: VideoMode,
    outbound: Arc<BoundedQueue<MediaChunk>>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let (result, returned_frames) = tokio::task::spawn_blocking(move || {
            let result = frames.capture();
            (result, frames)
        })
        .await
        .map_err(|e| PipelineError::Join(e.to_string()))?;
        frames = returned_frames;

        if cancel.is_cancelled() {
            return Ok(());
        }

        match result {
            Ok(frame) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = outbound.put(MediaChunk::Image {
                        data: frame.data,
                        mime_type: frame.mime_type.to_string(),
                    }) => {}
                }
            }
            Err(e) if mode == VideoMode::Camera => {
                info!("camera capture ended: {}", e);
                return Ok(());
            }
            Err(e) => {
                warn!("frame capture failed, retrying next tick: {}", e);
            }
        }
    }
}

/// Drain the outbound queue into the remote session. Transient faults
/// are retried after a short delay; anything else escalates.
pub async fn send_to_remote(
    remote: Arc<dyn RemoteSession>,
    outbound: Arc<BoundedQueue<MediaChunk>>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            chunk = outbound.get() => chunk,
        };

        match remote.send(chunk).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!("transient send fault, retrying: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(TRANSIENT_RETRY_DELAY) => {}
                }
            }
            Err(e) => return Err(PipelineError::Remote(e)),
        }
    }
}

/// Pump server events: audio payloads onto the inbound queue,
/// transcriptions into the shared slot. A clean end of stream or a
/// server GoAway ends this task only.
pub async fn receive_from_remote(
    remote: Arc<dyn RemoteSession>,
    inbound: Arc<BoundedQueue<Vec<u8>>>,
    transcript: watch::Sender<Option<Transcript>>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = remote.receive() => next,
        };

        match next {
            None => {
                info!("remote stream ended");
                return Ok(());
            }
            Some(Ok(ServerEvent::Audio(pcm))) => {
                inbound.put(pcm).await;
            }
            Some(Ok(ServerEvent::Transcription(t))) => {
                transcript.send_replace(Some(t));
            }
            Some(Ok(ServerEvent::TurnComplete)) => {
                debug!("turn complete");
            }
            Some(Ok(ServerEvent::GoAway)) => {
                info!("server requested disconnect");
                return Ok(());
            }
            Some(Err(e)) if e.is_transient() => {
                warn!("transient receive fault, retrying: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(TRANSIENT_RETRY_DELAY) => {}
                }
            }
            Some(Err(e)) => return Err(PipelineError::Remote(e)),
        }
    }
}

/// Drain the inbound queue into the speaker. A playback device fault is
/// task-local: the session keeps relaying even if local audio is gone.
pub async fn playback_audio(
    mut speaker: Box<dyn AudioSink>,
    inbound: Arc<BoundedQueue<Vec<u8>>>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let pcm = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            pcm = inbound.get() => pcm,
        };

        let (result, returned_speaker) = tokio::task::spawn_blocking(move || {
            let result = speaker.write(&pcm);
            (result, speaker)
        })
        .await
        .map_err(|e| PipelineError::Join(e.to_string()))?;
        speaker = returned_speaker;

        if let Err(e) = result {
            warn!("playback ended: {}", e);
            return Ok(());
        }
    }
}
