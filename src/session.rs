//! Session controller
//!
//! A single long-lived actor owns the one live session: HTTP handlers
//! talk to it through a cloneable handle over a command channel, so no
//! session state lives in globals and no second scheduler is ever spun
//! up per request. The actor runs the lifecycle state machine, the
//! connect-with-retry policy, and supervises the pipeline task set.

use crate::events::{MediaChunk, Transcript, VideoMode};
use crate::media::MediaDevices;
use crate::pipeline::{self, PipelineError, OUTBOUND_CAPACITY};
use crate::queue::BoundedQueue;
use crate::remote::{RemoteConnector, RemoteError, RemoteSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection attempts before giving up.
pub const MAX_RETRIES: u32 = 3;
/// Fixed delay between attempts; no backoff.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Lifecycle states of the (at most one) live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Running,
    Paused,
    Stopping,
    Terminated,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("connection failed after {attempts} attempts: {source}")]
    ConnectFailed { attempts: u32, source: RemoteError },

    /// A pipeline task died while the session ran; reported on the
    /// next control call.
    #[error("session failed: {0}")]
    SessionFailed(String),

    #[error("could not open devices: {0}")]
    Device(#[from] crate::media::DeviceError),

    #[error("controller is gone")]
    ControllerGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Resumed,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    Paused,
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    NotPaused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

enum Command {
    Start {
        mode: Option<VideoMode>,
        reply: oneshot::Sender<Result<StartOutcome, ControlError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<PauseOutcome, ControlError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<ResumeOutcome, ControlError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<StopOutcome, ControlError>>,
    },
    Terminate {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
}

/// Cloneable front door to the controller actor.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    transcript: watch::Receiver<Option<Transcript>>,
}

impl ControllerHandle {
    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ControlError::ControllerGone)?;
        rx.await.map_err(|_| ControlError::ControllerGone)
    }

    pub async fn start(&self, mode: Option<VideoMode>) -> Result<StartOutcome, ControlError> {
        self.request(|reply| Command::Start { mode, reply }).await?
    }

    pub async fn pause(&self) -> Result<PauseOutcome, ControlError> {
        self.request(|reply| Command::Pause { reply }).await?
    }

    pub async fn resume(&self) -> Result<ResumeOutcome, ControlError> {
        self.request(|reply| Command::Resume { reply }).await?
    }

    pub async fn stop(&self) -> Result<StopOutcome, ControlError> {
        self.request(|reply| Command::Stop { reply }).await?
    }

    pub async fn terminate(&self) -> Result<(), ControlError> {
        self.request(|reply| Command::Terminate { reply }).await
    }

    pub async fn state(&self) -> Result<SessionState, ControlError> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Latest transcription reported by the remote, if any.
    pub fn transcription(&self) -> Option<Transcript> {
        self.transcript.borrow().clone()
    }
}

/// Everything belonging to the one live session.
struct ActiveSession {
    state: SessionState,
    video_mode: VideoMode,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    tasks: JoinSet<Result<(), PipelineError>>,
    outbound: Arc<BoundedQueue<MediaChunk>>,
    inbound: Arc<BoundedQueue<Vec<u8>>>,
    remote: Arc<dyn RemoteSession>,
}

/// Cancel everything, close the remote, join the task set and drain
/// both queues. Safe to call at most once per session; devices are
/// dropped by their owning tasks as they exit, so handles cannot be
/// double-released.
async fn teardown(active: &mut ActiveSession) {
    active.state = SessionState::Stopping;
    active.cancel.cancel();
    active.remote.close().await;
    while let Some(joined) = active.tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("pipeline task ended with error during teardown: {}", e),
            Err(e) => error!("pipeline task panicked during teardown: {}", e),
        }
    }
    active.outbound.clear().await;
    active.inbound.clear().await;
}

enum Wakeup {
    Command(Option<Command>),
    TaskExit(Result<Result<(), PipelineError>, JoinError>),
}

pub struct SessionController {
    connector: Arc<dyn RemoteConnector>,
    devices: Arc<dyn MediaDevices>,
    default_mode: VideoMode,
    retry_delay: Duration,
    commands: mpsc::Receiver<Command>,
    transcript: watch::Sender<Option<Transcript>>,
    active: Option<ActiveSession>,
    /// State reported while no session is live (Idle, Terminated or
    /// Failed).
    rest_state: SessionState,
    /// Failure recorded by the supervisor, surfaced on the next
    /// control call.
    pending_failure: Option<String>,
}

impl SessionController {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        devices: Arc<dyn MediaDevices>,
        default_mode: VideoMode,
    ) -> (Self, ControllerHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (transcript_tx, transcript_rx) = watch::channel(None);
        let controller = Self {
            connector,
            devices,
            default_mode,
            retry_delay: RETRY_DELAY,
            commands: command_rx,
            transcript: transcript_tx,
            active: None,
            rest_state: SessionState::Idle,
            pending_failure: None,
        };
        let handle = ControllerHandle {
            commands: command_tx,
            transcript: transcript_rx,
        };
        (controller, handle)
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Actor loop: commands are handled one at a time, interleaved with
    /// supervision of the running task set.
    pub async fn run(mut self) {
        loop {
            let wakeup = match self.active.as_mut() {
                Some(active) => tokio::select! {
                    command = self.commands.recv() => Wakeup::Command(command),
                    Some(joined) = active.tasks.join_next() => Wakeup::TaskExit(joined),
                },
                None => Wakeup::Command(self.commands.recv().await),
            };

            match wakeup {
                Wakeup::Command(Some(command)) => self.handle_command(command).await,
                Wakeup::Command(None) => {
                    // All handles dropped; tear the session down and exit.
                    if let Some(mut active) = self.active.take() {
                        teardown(&mut active).await;
                    }
                    return;
                }
                Wakeup::TaskExit(joined) => self.on_task_exit(joined).await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { mode, reply } => {
                let _ = reply.send(self.start(mode).await);
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume());
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop().await);
            }
            Command::Terminate { reply } => {
                self.terminate().await;
                let _ = reply.send(());
            }
            Command::State { reply } => {
                let state = self
                    .active
                    .as_ref()
                    .map(|a| a.state)
                    .unwrap_or(self.rest_state);
                let _ = reply.send(state);
            }
        }
    }

    /// Surface a recorded pipeline failure once, then reset to Idle so
    /// a fresh session may be started.
    fn take_failure(&mut self) -> Option<ControlError> {
        let message = self.pending_failure.take()?;
        self.rest_state = SessionState::Idle;
        Some(ControlError::SessionFailed(message))
    }

    async fn start(&mut self, mode: Option<VideoMode>) -> Result<StartOutcome, ControlError> {
        if let Some(active) = self.active.as_mut() {
            return Ok(match active.state {
                SessionState::Paused => {
                    active.pause.send_replace(false);
                    active.state = SessionState::Running;
                    info!("session resumed");
                    StartOutcome::Resumed
                }
                _ => StartOutcome::AlreadyRunning,
            });
        }
        if let Some(failure) = self.take_failure() {
            return Err(failure);
        }

        let video_mode = mode.unwrap_or(self.default_mode);
        self.rest_state = SessionState::Connecting;
        let remote = match self.connect_with_retry().await {
            Ok(remote) => remote,
            Err(e) => {
                self.rest_state = SessionState::Failed;
                return Err(e);
            }
        };

        match self.spawn_session(remote, video_mode) {
            Ok(()) => {
                info!("session running (video mode: {})", video_mode);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                self.rest_state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Up to MAX_RETRIES independent attempts with a fixed delay in
    /// between; the last error propagates once retries are exhausted.
    async fn connect_with_retry(&self) -> Result<Arc<dyn RemoteSession>, ControlError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(remote) => {
                    info!("connected on attempt {}", attempt);
                    return Ok(remote);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    warn!("connection attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!("connection attempt {} failed, giving up: {}", attempt, e);
                    return Err(ControlError::ConnectFailed {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    fn spawn_session(
        &mut self,
        remote: Arc<dyn RemoteSession>,
        video_mode: VideoMode,
    ) -> Result<(), ControlError> {
        let mic = match self.devices.open_microphone() {
            Ok(mic) => mic,
            Err(e) => {
                let remote_handle = remote.clone();
                tokio::spawn(async move { remote_handle.close().await });
                return Err(e.into());
            }
        };
        let speaker = match self.devices.open_speaker() {
            Ok(speaker) => speaker,
            Err(e) => {
                let remote_handle = remote.clone();
                tokio::spawn(async move { remote_handle.close().await });
                return Err(e.into());
            }
        };

        let outbound = Arc::new(BoundedQueue::bounded(OUTBOUND_CAPACITY));
        let inbound = Arc::new(BoundedQueue::unbounded());
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        self.transcript.send_replace(None);

        let mut tasks = JoinSet::new();
        tasks.spawn(pipeline::capture_audio(
            mic,
            outbound.clone(),
            cancel.clone(),
            pause_rx,
        ));
        tasks.spawn(pipeline::send_to_remote(
            remote.clone(),
            outbound.clone(),
            cancel.clone(),
        ));
        tasks.spawn(pipeline::receive_from_remote(
            remote.clone(),
            inbound.clone(),
            self.transcript.clone(),
            cancel.clone(),
        ));
        tasks.spawn(pipeline::playback_audio(
            speaker,
            inbound.clone(),
            cancel.clone(),
        ));

        if video_mode != VideoMode::None {
            // A missing frame source leaves the session audio-only; it
            // never blocks starting.
            match self.devices.open_frame_source(video_mode) {
                Ok(frames) => {
                    tasks.spawn(pipeline::capture_video(
                        frames,
                        video_mode,
                        outbound.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => warn!("no {} source, continuing audio-only: {}", video_mode, e),
            }
        }

        self.active = Some(ActiveSession {
            state: SessionState::Running,
            video_mode,
            cancel,
            pause: pause_tx,
            tasks,
            outbound,
            inbound,
            remote,
        });
        Ok(())
    }

    fn pause(&mut self) -> Result<PauseOutcome, ControlError> {
        if let Some(failure) = self.take_failure() {
            return Err(failure);
        }
        match self.active.as_mut() {
            Some(active) => {
                active.pause.send_replace(true);
                active.state = SessionState::Paused;
                info!("session paused");
                Ok(PauseOutcome::Paused)
            }
            None => Ok(PauseOutcome::NotRunning),
        }
    }

    fn resume(&mut self) -> Result<ResumeOutcome, ControlError> {
        if let Some(failure) = self.take_failure() {
            return Err(failure);
        }
        match self.active.as_mut() {
            Some(active) if active.state == SessionState::Paused => {
                active.pause.send_replace(false);
                active.state = SessionState::Running;
                info!("session resumed");
                Ok(ResumeOutcome::Resumed)
            }
            _ => Ok(ResumeOutcome::NotPaused),
        }
    }

    async fn stop(&mut self) -> Result<StopOutcome, ControlError> {
        if let Some(failure) = self.take_failure() {
            return Err(failure);
        }
        match self.active.take() {
            Some(mut active) => {
                info!("stopping session (video mode: {})", active.video_mode);
                teardown(&mut active).await;
                self.transcript.send_replace(None);
                self.rest_state = SessionState::Idle;
                Ok(StopOutcome::Stopped)
            }
            None => Ok(StopOutcome::NotRunning),
        }
    }

    /// Like stop, but the controller rests in Terminated. Always
    /// succeeds, including when nothing is running.
    async fn terminate(&mut self) {
        self.pending_failure = None;
        if let Some(mut active) = self.active.take() {
            teardown(&mut active).await;
            info!("session terminated");
        }
        self.transcript.send_replace(None);
        self.rest_state = SessionState::Terminated;
    }

    async fn on_task_exit(&mut self, joined: Result<Result<(), PipelineError>, JoinError>) {
        match joined {
            Ok(Ok(())) => {
                debug!("pipeline task ended");
            }
            Ok(Err(e)) => {
                error!("pipeline task failed: {}", e);
                self.fail_session(e.to_string()).await;
            }
            Err(e) => {
                error!("pipeline task panicked: {}", e);
                self.fail_session(format!("task panicked: {}", e)).await;
            }
        }
    }

    async fn fail_session(&mut self, message: String) {
        if let Some(mut active) = self.active.take() {
            teardown(&mut active).await;
        }
        self.rest_state = SessionState::Failed;
        self.pending_failure = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioSink, AudioSource, DeviceError, FrameSource};
    use crate::remote::ServerEvent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const FAST_RETRY: Duration = Duration::from_millis(10);

    struct StubRemote {
        closed: Arc<AtomicBool>,
        /// Events replayed to the receive task; empty means the stream
        /// stays open (receive pends forever).
        scripted: std::sync::Mutex<Vec<Result<ServerEvent, RemoteError>>>,
    }

    #[async_trait]
    impl RemoteSession for StubRemote {
        async fn send(&self, _chunk: MediaChunk) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn receive(&self) -> Option<Result<ServerEvent, RemoteError>> {
            let next = {
                let mut scripted = self.scripted.lock().unwrap();
                if scripted.is_empty() {
                    None
                } else {
                    Some(scripted.remove(0))
                }
            };
            match next {
                Some(event) => Some(event),
                None => std::future::pending().await,
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct StubConnector {
        connects: AtomicUsize,
        failures_before_success: AtomicUsize,
        closed: Arc<AtomicBool>,
        scripted: std::sync::Mutex<Vec<Result<ServerEvent, RemoteError>>>,
    }

    impl StubConnector {
        fn new(failures_before_success: usize) -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                failures_before_success: AtomicUsize::new(failures_before_success),
                closed: Arc::new(AtomicBool::new(false)),
                scripted: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn scripted(events: Vec<Result<ServerEvent, RemoteError>>) -> Arc<Self> {
            let connector = Self::new(0);
            *connector.scripted.lock().unwrap() = events;
            connector
        }
    }

    #[async_trait]
    impl RemoteConnector for StubConnector {
        async fn connect(&self) -> Result<Arc<dyn RemoteSession>, RemoteError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RemoteError::Connect("refused".to_string()));
            }
            let mut scripted = self.scripted.lock().unwrap();
            Ok(Arc::new(StubRemote {
                closed: self.closed.clone(),
                scripted: std::sync::Mutex::new(std::mem::take(&mut *scripted)),
            }))
        }
    }

    struct TrackedMic {
        released: Arc<AtomicBool>,
    }
    impl AudioSource for TrackedMic {
        fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
            buf.fill(0);
            std::thread::sleep(Duration::from_millis(2));
            Ok(())
        }
    }
    impl Drop for TrackedMic {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct TrackedSpeaker {
        released: Arc<AtomicBool>,
    }
    impl AudioSink for TrackedSpeaker {
        fn write(&mut self, _data: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }
    }
    impl Drop for TrackedSpeaker {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct StubDevices {
        mic_released: Arc<AtomicBool>,
        speaker_released: Arc<AtomicBool>,
    }

    impl StubDevices {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                mic_released: Arc::new(AtomicBool::new(false)),
                speaker_released: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    impl MediaDevices for StubDevices {
        fn open_microphone(&self) -> Result<Box<dyn AudioSource>, DeviceError> {
            self.mic_released.store(false, Ordering::SeqCst);
            Ok(Box::new(TrackedMic {
                released: self.mic_released.clone(),
            }))
        }

        fn open_speaker(&self) -> Result<Box<dyn AudioSink>, DeviceError> {
            self.speaker_released.store(false, Ordering::SeqCst);
            Ok(Box::new(TrackedSpeaker {
                released: self.speaker_released.clone(),
            }))
        }

        fn open_frame_source(
            &self,
            _mode: VideoMode,
        ) -> Result<Box<dyn FrameSource>, DeviceError> {
            Err(DeviceError::Unavailable("no frame source in tests".to_string()))
        }
    }

    fn launch(
        connector: Arc<StubConnector>,
        devices: Arc<StubDevices>,
    ) -> ControllerHandle {
        let (controller, handle) =
            SessionController::new(connector, devices, VideoMode::None);
        tokio::spawn(controller.with_retry_delay(FAST_RETRY).run());
        handle
    }

    #[tokio::test]
    async fn start_succeeds_on_third_attempt() {
        let connector = StubConnector::new(2);
        let handle = launch(connector.clone(), StubDevices::new());

        let outcome = handle.start(None).await.unwrap();
        assert_eq!(outcome, StartOutcome::Started);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert_eq!(handle.state().await.unwrap(), SessionState::Running);

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn connect_retries_exhausted_reaches_failed() {
        let connector = StubConnector::new(usize::MAX);
        let handle = launch(connector.clone(), StubDevices::new());

        let err = handle.start(None).await.unwrap_err();
        match err {
            ControlError::ConnectFailed { attempts, .. } => assert_eq!(attempts, MAX_RETRIES),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), MAX_RETRIES as usize);
        assert_eq!(handle.state().await.unwrap(), SessionState::Failed);
    }

    #[tokio::test]
    async fn second_start_reports_already_running_without_reconnecting() {
        let connector = StubConnector::new(0);
        let handle = launch(connector.clone(), StubDevices::new());

        assert_eq!(handle.start(None).await.unwrap(), StartOutcome::Started);
        assert_eq!(handle.start(None).await.unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn pause_and_resume_keep_the_remote_session_open() {
        let connector = StubConnector::new(0);
        let handle = launch(connector.clone(), StubDevices::new());

        handle.start(None).await.unwrap();
        assert_eq!(handle.pause().await.unwrap(), PauseOutcome::Paused);
        assert_eq!(handle.state().await.unwrap(), SessionState::Paused);
        assert!(!connector.closed.load(Ordering::SeqCst));

        assert_eq!(handle.resume().await.unwrap(), ResumeOutcome::Resumed);
        assert_eq!(handle.state().await.unwrap(), SessionState::Running);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn start_resumes_a_paused_session() {
        let connector = StubConnector::new(0);
        let handle = launch(connector.clone(), StubDevices::new());

        handle.start(None).await.unwrap();
        handle.pause().await.unwrap();
        assert_eq!(handle.start(None).await.unwrap(), StartOutcome::Resumed);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn resume_while_idle_is_a_noop() {
        let handle = launch(StubConnector::new(0), StubDevices::new());
        assert_eq!(handle.resume().await.unwrap(), ResumeOutcome::NotPaused);
        assert_eq!(handle.pause().await.unwrap(), PauseOutcome::NotRunning);
        assert_eq!(handle.stop().await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn stop_releases_devices_and_closes_remote() {
        let connector = StubConnector::new(0);
        let devices = StubDevices::new();
        let handle = launch(connector.clone(), devices.clone());

        handle.start(None).await.unwrap();
        assert_eq!(handle.stop().await.unwrap(), StopOutcome::Stopped);
        assert_eq!(handle.state().await.unwrap(), SessionState::Idle);
        assert!(connector.closed.load(Ordering::SeqCst));
        assert!(devices.mic_released.load(Ordering::SeqCst));
        assert!(devices.speaker_released.load(Ordering::SeqCst));

        // Idempotent: a second stop is a quiet no-op.
        assert_eq!(handle.stop().await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_reaches_terminated() {
        let connector = StubConnector::new(0);
        let devices = StubDevices::new();
        let handle = launch(connector.clone(), devices.clone());

        handle.start(None).await.unwrap();
        handle.terminate().await.unwrap();
        assert_eq!(handle.state().await.unwrap(), SessionState::Terminated);
        assert!(devices.mic_released.load(Ordering::SeqCst));
        assert!(devices.speaker_released.load(Ordering::SeqCst));

        // Terminate after terminate (or after stop) must not error.
        handle.terminate().await.unwrap();
        assert_eq!(handle.state().await.unwrap(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn restart_after_stop_creates_a_fresh_session() {
        let connector = StubConnector::new(0);
        let handle = launch(connector.clone(), StubDevices::new());

        handle.start(None).await.unwrap();
        handle.stop().await.unwrap();
        assert_eq!(handle.start(None).await.unwrap(), StartOutcome::Started);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn fatal_task_error_fails_session_and_surfaces_on_next_call() {
        // The receive task hits a fatal stream error right away.
        let connector = StubConnector::scripted(vec![Err(RemoteError::Protocol(
            "stream corrupted".to_string(),
        ))]);
        let devices = StubDevices::new();
        let handle = launch(connector.clone(), devices.clone());

        handle.start(None).await.unwrap();

        // Supervisor notices, cancels siblings, fails the session.
        let mut state = SessionState::Running;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = handle.state().await.unwrap();
            if state == SessionState::Failed {
                break;
            }
        }
        assert_eq!(state, SessionState::Failed);
        assert!(devices.mic_released.load(Ordering::SeqCst));

        // The failure surfaces exactly once, on the next control call.
        let err = handle.pause().await.unwrap_err();
        assert!(matches!(err, ControlError::SessionFailed(_)));

        // After that the controller accepts a fresh start.
        assert_eq!(handle.start(None).await.unwrap(), StartOutcome::Started);
        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn teardown_drains_both_queues() {
        let connector = StubConnector::new(0);
        let remote = connector.connect().await.unwrap();
        let outbound = Arc::new(BoundedQueue::bounded(OUTBOUND_CAPACITY));
        let inbound = Arc::new(BoundedQueue::unbounded());
        outbound.put(MediaChunk::audio(vec![0, 0])).await;
        inbound.put(vec![1, 1]).await;

        let (pause, _) = watch::channel(false);
        let mut active = ActiveSession {
            state: SessionState::Running,
            video_mode: VideoMode::None,
            cancel: CancellationToken::new(),
            pause,
            tasks: JoinSet::new(),
            outbound: outbound.clone(),
            inbound: inbound.clone(),
            remote,
        };

        timeout(Duration::from_secs(1), teardown(&mut active))
            .await
            .unwrap();
        assert!(outbound.is_empty().await);
        assert!(inbound.is_empty().await);
        assert!(connector.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn mic_keeps_feeding_quietly_while_running() {
        // Sanity check that a running session with a quiet mic stays
        // Running rather than drifting into Failed.
        let connector = StubConnector::new(0);
        let handle = launch(connector, StubDevices::new());
        handle.start(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.state().await.unwrap(), SessionState::Running);
        handle.terminate().await.unwrap();
    }
}
