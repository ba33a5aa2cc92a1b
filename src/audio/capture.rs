//! Capture pipeline
//!
//! Reads fixed-size frames from the microphone on a dedicated thread and
//! delivers them either to a [`FrameQueue`] feeding delayed live playback, or
//! to a raw PCM file.
//!
//! In live mode the capture thread is also the one that starts playback: the
//! push that brings the queue up to `delay_frames` claims the queue's consumer
//! binding and spawns a [`PlaybackPipeline`]. Everything captured before that
//! push is what gives playback its fixed lag behind the microphone.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use super::device::{AudioBackend, AudioSource};
use super::file::{FileCapture, IoErrorPolicy};
use super::frame::{CaptureBuffer, CopyStrategy, Frame};
use super::handle::{
    spawn_with_startup, CancellationToken, CompletionCallback, Phase, PhaseCell, PipelineKind,
    Startup,
};
use super::playback::{PlaybackPipeline, PlaybackReport};
use super::queue::FrameQueue;
use crate::error::{PipelineError, PipelineResult};
use crate::settings::PipelineConfig;

/// Current state of a capture pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Capturing,
    /// Stop requested; the thread is finishing its current read
    Stopping,
}

impl From<Phase> for CaptureState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Running => CaptureState::Capturing,
            Phase::Stopping => CaptureState::Stopping,
            Phase::Idle | Phase::Stopped => CaptureState::Idle,
        }
    }
}

/// Where captured frames go
#[derive(Debug, Clone)]
pub enum CaptureTarget {
    /// Queue frames and play them back once `delay_frames` are buffered
    DelayedPlayback,
    /// Append frames to a file
    File(FileCapture),
}

/// Summary of one capture session
#[derive(Debug, Default)]
pub struct CaptureReport {
    pub frames_captured: u64,
    pub bytes_captured: u64,
    /// Playback pipelines started by this session (0 or 1)
    pub playback_spawns: u32,
    /// File writes that failed and were skipped
    pub io_errors: u64,
    /// Why the session ended, when it was not a stop request
    pub error: Option<PipelineError>,
    /// Report of the playback this session started, once it has finished
    pub playback: Option<PlaybackReport>,
}

/// What the capture thread hands back on exit
struct CaptureOutcome {
    report: CaptureReport,
    playback: Option<PlaybackPipeline>,
}

struct Session {
    token: CancellationToken,
    queue: Option<Arc<FrameQueue>>,
    thread: JoinHandle<CaptureOutcome>,
}

/// Microphone capture driving either delayed playback or a file recording
pub struct CapturePipeline {
    backend: Arc<dyn AudioBackend>,
    config: PipelineConfig,
    target: CaptureTarget,
    strategy: CopyStrategy,
    on_complete: Option<CompletionCallback>,
    state: PhaseCell,
    session: Mutex<Option<Session>>,
}

impl CapturePipeline {
    /// Live loopback: capture, buffer `playback_delay_ms`, then play
    pub fn delayed_playback(backend: Arc<dyn AudioBackend>, config: PipelineConfig) -> Self {
        Self::new(backend, config, CaptureTarget::DelayedPlayback)
    }

    /// Record to a raw PCM file
    pub fn to_file(
        backend: Arc<dyn AudioBackend>,
        config: PipelineConfig,
        file: FileCapture,
    ) -> Self {
        Self::new(backend, config, CaptureTarget::File(file))
    }

    pub fn new(backend: Arc<dyn AudioBackend>, config: PipelineConfig, target: CaptureTarget) -> Self {
        Self {
            backend,
            config,
            target,
            strategy: CopyStrategy::default(),
            on_complete: None,
            state: PhaseCell::new(),
            session: Mutex::new(None),
        }
    }

    pub fn with_copy_strategy(mut self, strategy: CopyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Callback run when the capture thread exits, and passed on to the
    /// playback it spawns
    pub fn with_completion(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        self.state.load().into()
    }

    pub fn is_running(&self) -> bool {
        self.state() != CaptureState::Idle
    }

    /// Frames currently waiting for playback (live mode only)
    pub fn queued_frames(&self) -> usize {
        self.lock_session()
            .as_ref()
            .and_then(|s| s.queue.as_ref())
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the microphone and start a capture session.
    ///
    /// Fails with [`PipelineError::AlreadyRunning`] while a session is
    /// capturing or stopping, and with [`PipelineError::DeviceUnavailable`]
    /// if the device cannot be opened; in both cases the pipeline is left as
    /// it was.
    pub fn start(&self) -> PipelineResult<()> {
        self.config.validate()?;
        if !self.state.try_begin() {
            log::debug!("Capture already started");
            return Err(PipelineError::AlreadyRunning);
        }

        let mut session = self.lock_session();
        if let Some(previous) = session.take() {
            // Finished on its own; nobody joined it yet
            let outcome = join_outcome(previous.thread);
            log::debug!(
                "Reaped previous capture session ({} frames)",
                outcome.report.frames_captured
            );
        }

        let token = CancellationToken::new();
        let destination = match &self.target {
            CaptureTarget::DelayedPlayback => Destination::Queue {
                queue: Arc::new(FrameQueue::new()),
                threshold: self.config.delay_frames(),
                playback: None,
            },
            CaptureTarget::File(file) => Destination::File(file.clone()),
        };
        let queue = match &destination {
            Destination::Queue { queue, .. } => Some(Arc::clone(queue)),
            Destination::File(_) => None,
        };

        let context = CaptureContext {
            backend: Arc::clone(&self.backend),
            config: self.config,
            strategy: self.strategy,
            destination,
            token: token.clone(),
            state: self.state.clone(),
            on_complete: self.on_complete.clone(),
        };

        match spawn_with_startup("capture", move |startup: Startup| context.run(startup)) {
            Ok(thread) => {
                log::info!(
                    "Capture started ({} Hz, {} byte frames, {} frame delay)",
                    self.config.sample_rate,
                    self.config.frame_bytes,
                    self.config.delay_frames()
                );
                *session = Some(Session {
                    token,
                    queue,
                    thread,
                });
                Ok(())
            }
            Err(err) => {
                self.state.store(Phase::Idle);
                Err(err)
            }
        }
    }

    /// Ask the capture thread to stop.
    ///
    /// Returns immediately; a read already in progress completes (and its
    /// frame is delivered) before the thread notices. A no-op when idle.
    pub fn stop(&self) {
        if !self.state.transition(Phase::Running, Phase::Stopping) {
            return;
        }
        log::info!("Stopping capture");
        if let Some(session) = self.lock_session().as_ref() {
            session.token.cancel();
        }
    }

    /// Wait for the capture thread, and then for any playback it started.
    ///
    /// Returns `None` if there is no session to join.
    pub fn join(&self) -> Option<CaptureReport> {
        let session = self.lock_session().take()?;
        let CaptureOutcome {
            mut report,
            playback,
        } = join_outcome(session.thread);
        if let Some(playback) = playback {
            report.playback = Some(playback.join());
        }
        Some(report)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn join_outcome(thread: JoinHandle<CaptureOutcome>) -> CaptureOutcome {
    thread.join().unwrap_or_else(|_| {
        log::error!("Capture thread panicked");
        CaptureOutcome {
            report: CaptureReport {
                error: Some(PipelineError::ThreadPanicked),
                ..Default::default()
            },
            playback: None,
        }
    })
}

/// Per-session delivery target
enum Destination {
    Queue {
        queue: Arc<FrameQueue>,
        threshold: usize,
        playback: Option<PlaybackPipeline>,
    },
    File(FileCapture),
}

/// Everything the capture thread owns
struct CaptureContext {
    backend: Arc<dyn AudioBackend>,
    config: PipelineConfig,
    strategy: CopyStrategy,
    destination: Destination,
    token: CancellationToken,
    state: PhaseCell,
    on_complete: Option<CompletionCallback>,
}

impl CaptureContext {
    fn run(mut self, startup: Startup) -> CaptureOutcome {
        let mut source = match self.backend.open_source(&self.config.device_format()) {
            Ok(source) => source,
            Err(err) => {
                log::error!("Failed to open capture device: {}", err);
                startup.failed(err);
                return CaptureOutcome {
                    report: CaptureReport::default(),
                    playback: None,
                };
            }
        };

        if let Destination::File(file) = &self.destination {
            if let Err(e) = file.prepare() {
                log::warn!("Failed to remove previous recording: {}", e);
            }
        }
        startup.ready();

        let mut report = CaptureReport::default();
        if let Err(err) = self.capture_loop(source.as_mut(), &mut report) {
            log::error!("Capture ended with error: {}", err);
            report.error = Some(err);
        }

        let playback = match self.destination {
            Destination::Queue {
                queue, playback, ..
            } => {
                if queue.close() {
                    log::debug!(
                        "End of stream queued behind {} frames",
                        queue.len().saturating_sub(1)
                    );
                }
                playback
            }
            Destination::File(_) => None,
        };

        drop(source);
        self.state.store(Phase::Idle);
        log::info!(
            "Capture finished: {} frames, {} bytes",
            report.frames_captured,
            report.bytes_captured
        );
        if let Some(callback) = &self.on_complete {
            callback(PipelineKind::Capture);
        }

        CaptureOutcome { report, playback }
    }

    fn capture_loop(
        &mut self,
        source: &mut dyn AudioSource,
        report: &mut CaptureReport,
    ) -> PipelineResult<()> {
        let mut buffer = CaptureBuffer::new(self.config.frame_bytes);

        while !self.token.is_cancelled() {
            let n_read = source.read(buffer.view_mut())?;
            if n_read == 0 {
                continue;
            }
            let bytes = self.strategy.valid_bytes(&buffer, n_read);
            report.frames_captured += 1;
            report.bytes_captured += bytes.len() as u64;

            match &mut self.destination {
                Destination::Queue {
                    queue,
                    threshold,
                    playback,
                } => {
                    if queue.push_with_threshold(Frame::from(bytes), *threshold) {
                        log::info!("{} frames buffered, starting playback", queue.len());
                        let pipeline = PlaybackPipeline::live(
                            Arc::clone(queue),
                            Arc::clone(&self.backend),
                            self.config.device_format(),
                            self.on_complete.clone(),
                        )?;
                        report.playback_spawns += 1;
                        *playback = Some(pipeline);
                    } else if queue.consumer_released() {
                        // Playback died with the queue still open; nothing would drain it
                        if let Some(pipeline) = playback.take() {
                            let mut finished = pipeline.join();
                            let err = finished
                                .error
                                .take()
                                .unwrap_or(PipelineError::PlaybackEnded);
                            report.playback = Some(finished);
                            return Err(err);
                        }
                    }
                }
                Destination::File(file) => {
                    if let Err(e) = file.append(bytes) {
                        match file.policy() {
                            IoErrorPolicy::LogAndContinue => {
                                report.io_errors += 1;
                                log::warn!(
                                    "Failed to append to {}: {}",
                                    file.path().display(),
                                    e
                                );
                            }
                            IoErrorPolicy::Abort => return Err(e.into()),
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
