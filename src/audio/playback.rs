//! Playback pipeline
//!
//! Pulls frames from a [`FrameFeed`] and writes them to an [`AudioSink`] on a
//! dedicated thread. Every write blocks until the device has taken all bytes
//! and is followed by a flush, so device-side latency cannot build up.

use std::sync::Arc;
use std::thread::JoinHandle;

use super::device::{AudioBackend, AudioSink, DeviceFormat};
use super::frame::Frame;
use super::handle::{
    spawn_with_startup, CancellationToken, CompletionCallback, Phase, PhaseCell, PipelineKind,
    Startup,
};
use super::queue::{FrameQueue, QueueItem};
use crate::error::{PipelineError, PipelineResult};

/// Playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Stopped,
}

impl From<Phase> for PlaybackState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Idle => PlaybackState::Idle,
            Phase::Running | Phase::Stopping => PlaybackState::Playing,
            Phase::Stopped => PlaybackState::Stopped,
        }
    }
}

/// Where a playback pipeline gets its frames
pub trait FrameFeed: Send {
    /// The next frame, or `None` at end of stream
    fn next_frame(&mut self) -> PipelineResult<Option<Frame>>;

    /// Called once after the sink has been released
    fn finish(&mut self) {}
}

/// Feed draining a [`FrameQueue`] until its end-of-stream marker
pub struct QueueFeed {
    queue: Arc<FrameQueue>,
}

impl QueueFeed {
    pub fn new(queue: Arc<FrameQueue>) -> Self {
        Self { queue }
    }
}

impl FrameFeed for QueueFeed {
    fn next_frame(&mut self) -> PipelineResult<Option<Frame>> {
        match self.queue.pop_blocking() {
            QueueItem::Frame(frame) => Ok(Some(frame)),
            QueueItem::EndOfStream => Ok(None),
        }
    }

    fn finish(&mut self) {
        self.queue.release_consumer();
    }
}

/// Summary of one playback session
#[derive(Debug, Default)]
pub struct PlaybackReport {
    pub frames_played: u64,
    pub bytes_played: u64,
    /// Why the session ended early, if it did
    pub error: Option<PipelineError>,
}

/// A running (or finished) playback thread
pub struct PlaybackPipeline {
    state: PhaseCell,
    token: CancellationToken,
    thread: Option<JoinHandle<PlaybackReport>>,
}

impl PlaybackPipeline {
    /// Start playing `queue` until its end-of-stream marker.
    ///
    /// The caller must hold the queue's consumer binding.
    pub fn live(
        queue: Arc<FrameQueue>,
        backend: Arc<dyn AudioBackend>,
        format: DeviceFormat,
        on_complete: Option<CompletionCallback>,
    ) -> PipelineResult<Self> {
        Self::spawn(backend, format, QueueFeed::new(queue), on_complete)
    }

    /// Open the sink on a new thread and play `feed` until it runs dry or the
    /// pipeline is stopped
    pub fn spawn<F>(
        backend: Arc<dyn AudioBackend>,
        format: DeviceFormat,
        feed: F,
        on_complete: Option<CompletionCallback>,
    ) -> PipelineResult<Self>
    where
        F: FrameFeed + 'static,
    {
        let state = PhaseCell::new();
        let token = CancellationToken::new();

        let thread = {
            let state = state.clone();
            let token = token.clone();
            spawn_with_startup("playback", move |startup: Startup| {
                playback_thread(backend, format, feed, state, token, on_complete, startup)
            })?
        };

        Ok(Self {
            state,
            token,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> PlaybackState {
        self.state.load().into()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// Ask the thread to stop after the frame it is currently writing
    pub fn stop(&self) {
        if self.state.transition(Phase::Running, Phase::Stopping) {
            log::info!("Stopping playback");
        }
        self.token.cancel();
    }

    /// Wait for the thread to finish
    pub fn join(mut self) -> PlaybackReport {
        self.join_thread()
    }

    fn join_thread(&mut self) -> PlaybackReport {
        match self.thread.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                log::error!("Playback thread panicked");
                self.state.store(Phase::Stopped);
                PlaybackReport {
                    error: Some(PipelineError::ThreadPanicked),
                    ..Default::default()
                }
            }),
            None => PlaybackReport::default(),
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
            self.join_thread();
        }
    }
}

fn playback_thread<F: FrameFeed>(
    backend: Arc<dyn AudioBackend>,
    format: DeviceFormat,
    mut feed: F,
    state: PhaseCell,
    token: CancellationToken,
    on_complete: Option<CompletionCallback>,
    startup: Startup,
) -> PlaybackReport {
    let mut sink = match backend.open_sink(&format) {
        Ok(sink) => sink,
        Err(err) => {
            log::error!("Failed to open playback device: {}", err);
            feed.finish();
            startup.failed(err);
            return PlaybackReport::default();
        }
    };
    state.store(Phase::Running);
    startup.ready();
    log::debug!("Playback thread running");

    let report = run_playback(sink.as_mut(), &mut feed, &token);
    if let Some(err) = &report.error {
        log::error!("Playback ended with error: {}", err);
    }
    log::info!(
        "Playback finished: {} frames, {} bytes",
        report.frames_played,
        report.bytes_played
    );

    drop(sink);
    state.store(Phase::Stopped);
    if let Some(callback) = &on_complete {
        callback(PipelineKind::Playback);
    }
    feed.finish();

    report
}

fn run_playback(
    sink: &mut dyn AudioSink,
    feed: &mut dyn FrameFeed,
    token: &CancellationToken,
) -> PlaybackReport {
    let mut report = PlaybackReport::default();

    while !token.is_cancelled() {
        let frame = match feed.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                report.error = Some(err);
                break;
            }
        };

        if let Err(err) = sink.write_all(frame.as_bytes()).and_then(|()| sink.flush()) {
            report.error = Some(err.into());
            break;
        }
        report.frames_played += 1;
        report.bytes_played += frame.len() as u64;
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{MockBackend, MockState};
    use crate::settings::PipelineConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn format() -> DeviceFormat {
        PipelineConfig::default().device_format()
    }

    #[test]
    fn test_plays_queue_until_end_of_stream() {
        let backend = MockBackend::default();
        let queue = Arc::new(FrameQueue::new());
        for i in 0..5u8 {
            queue.push(QueueItem::Frame(Frame::from(vec![i; 10])));
        }
        queue.close();

        let completions = Arc::new(AtomicUsize::new(0));
        let on_complete: CompletionCallback = {
            let completions = Arc::clone(&completions);
            Arc::new(move |kind| {
                assert_eq!(kind, PipelineKind::Playback);
                completions.fetch_add(1, Ordering::SeqCst);
            })
        };

        let playback =
            PlaybackPipeline::live(Arc::clone(&queue), backend.as_backend(), format(), Some(on_complete))
                .unwrap();
        let report = playback.join();

        assert!(report.error.is_none());
        assert_eq!(report.frames_played, 5);
        assert_eq!(report.bytes_played, 50);
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        let writes = backend.writes();
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[3], vec![3u8; 10]);
        assert_eq!(backend.flushes(), 5);
    }

    #[test]
    fn test_finishing_releases_queue_binding() {
        let backend = MockBackend::default();
        let queue = Arc::new(FrameQueue::new());
        assert!(queue.push_with_threshold(Frame::from(vec![1, 2]), 1));
        queue.close();

        let playback =
            PlaybackPipeline::live(Arc::clone(&queue), backend.as_backend(), format(), None).unwrap();
        let report = playback.join();

        assert_eq!(report.frames_played, 1);
        assert!(!queue.has_active_consumer());
    }

    #[test]
    fn test_sink_open_failure_is_device_unavailable() {
        let backend = MockBackend::new(MockState {
            fail_sink: true,
            ..Default::default()
        });
        let queue = Arc::new(FrameQueue::new());

        let result = PlaybackPipeline::live(queue, backend.as_backend(), format(), None);
        assert!(matches!(result, Err(PipelineError::DeviceUnavailable(_))));
        assert_eq!(backend.writes().len(), 0);
    }

    #[test]
    fn test_write_error_ends_playback() {
        let backend = MockBackend::new(MockState {
            fail_write_after: Some(2),
            ..Default::default()
        });
        let queue = Arc::new(FrameQueue::new());
        for i in 0..5u8 {
            queue.push(QueueItem::Frame(Frame::from(vec![i; 4])));
        }
        queue.close();

        let playback =
            PlaybackPipeline::live(queue, backend.as_backend(), format(), None).unwrap();
        let report = playback.join();

        assert_eq!(report.frames_played, 2);
        assert!(matches!(report.error, Some(PipelineError::Device(_))));
    }
}
