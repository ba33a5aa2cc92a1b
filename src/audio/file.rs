//! Raw PCM file capture and playback
//!
//! Files hold headerless 16-bit PCM exactly as it came off the device, no
//! matter what extension the path carries.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::device::AudioBackend;
use super::frame::Frame;
use super::handle::CompletionCallback;
use super::playback::{FrameFeed, PlaybackPipeline, PlaybackReport, PlaybackState};
use crate::error::{PipelineError, PipelineResult};
use crate::settings::PipelineConfig;

/// What file capture does when writing a frame fails
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum IoErrorPolicy {
    /// Log the error, drop the frame and keep capturing
    #[default]
    LogAndContinue,
    /// End the capture session
    Abort,
}

/// Capture destination that appends every frame to a file.
///
/// The file is reopened in append mode for each frame and closed again
/// straight away, so no handle outlives a single write.
#[derive(Debug, Clone)]
pub struct FileCapture {
    path: PathBuf,
    policy: IoErrorPolicy,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>, policy: IoErrorPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> IoErrorPolicy {
        self.policy
    }

    /// Remove the recording left by a previous session
    pub fn prepare(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!("Removed previous recording {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(bytes)
    }
}

/// Feed reading successive `frame_bytes` chunks from an open file
pub struct FileFeed {
    file: File,
    frame_bytes: usize,
}

impl FileFeed {
    pub fn new(file: File, frame_bytes: usize) -> Self {
        Self { file, frame_bytes }
    }
}

impl FrameFeed for FileFeed {
    fn next_frame(&mut self) -> PipelineResult<Option<Frame>> {
        let mut chunk = Vec::with_capacity(self.frame_bytes);
        (&mut self.file)
            .take(self.frame_bytes as u64)
            .read_to_end(&mut chunk)?;
        if chunk.is_empty() {
            log::debug!("Reached end of recording");
            return Ok(None);
        }
        Ok(Some(Frame::from(chunk)))
    }
}

/// Plays a raw PCM file through the playback pipeline
pub struct FilePlayback {
    backend: Arc<dyn AudioBackend>,
    config: PipelineConfig,
    path: PathBuf,
    on_complete: Option<CompletionCallback>,
    current: Option<PlaybackPipeline>,
}

impl FilePlayback {
    pub fn new(backend: Arc<dyn AudioBackend>, config: PipelineConfig, path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            config,
            path: path.into(),
            on_complete: None,
            current: None,
        }
    }

    pub fn with_completion(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start playing the file from the beginning.
    ///
    /// Fails with [`PipelineError::FileNotFound`] before any device is opened
    /// when the file does not exist.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.is_playing() {
            return Err(PipelineError::AlreadyRunning);
        }
        self.config.validate()?;

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("Recording {} not found", self.path.display());
                return Err(PipelineError::FileNotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        // Reap the previous session before starting another
        if let Some(previous) = self.current.take() {
            previous.join();
        }

        log::info!("Playing {}", self.path.display());
        let feed = FileFeed::new(file, self.config.frame_bytes);
        let pipeline = PlaybackPipeline::spawn(
            Arc::clone(&self.backend),
            self.config.device_format(),
            feed,
            self.on_complete.clone(),
        )?;
        self.current = Some(pipeline);
        Ok(())
    }

    /// Request a stop; a no-op when nothing is playing
    pub fn stop(&self) {
        if let Some(pipeline) = &self.current {
            if pipeline.is_playing() {
                pipeline.stop();
            }
        }
    }

    /// Wait for the current session to end
    pub fn join(&mut self) -> Option<PlaybackReport> {
        self.current.take().map(PlaybackPipeline::join)
    }

    pub fn state(&self) -> PlaybackState {
        self.current
            .as_ref()
            .map(PlaybackPipeline::state)
            .unwrap_or_default()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{wait_until, MockBackend, MockState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_missing_file_opens_no_device() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::default();
        let mut playback = FilePlayback::new(
            backend.as_backend(),
            PipelineConfig::default(),
            dir.path().join("audio.wav"),
        );

        let result = playback.start();
        assert!(matches!(result, Err(PipelineError::FileNotFound(_))));
        assert_eq!(backend.sinks_opened(), 0);
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert!(playback.join().is_none());
    }

    #[test]
    fn test_plays_file_in_frame_sized_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.wav");
        let data: Vec<u8> = (0..882 * 2 + 441).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let completions = Arc::new(AtomicUsize::new(0));
        let on_complete: CompletionCallback = {
            let completions = Arc::clone(&completions);
            Arc::new(move |_| {
                completions.fetch_add(1, Ordering::SeqCst);
            })
        };

        let backend = MockBackend::default();
        let mut playback =
            FilePlayback::new(backend.as_backend(), PipelineConfig::default(), &path)
                .with_completion(on_complete);
        playback.start().unwrap();
        let report = playback.join().unwrap();

        assert!(report.error.is_none());
        assert_eq!(report.frames_played, 3);
        let writes = backend.writes();
        let lens: Vec<usize> = writes.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![882, 882, 441]);
        assert_eq!(writes.concat(), data);
        assert_eq!(backend.flushes(), 3);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_ends_playback_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.wav");
        std::fs::write(&path, vec![0u8; 882 * 200]).unwrap();

        let backend = MockBackend::new(MockState {
            write_delay: Duration::from_millis(5),
            ..Default::default()
        });
        let mut playback =
            FilePlayback::new(backend.as_backend(), PipelineConfig::default(), &path);
        playback.start().unwrap();
        assert!(matches!(playback.start(), Err(PipelineError::AlreadyRunning)));

        assert!(wait_until(Duration::from_secs(5), || backend.write_count() >= 3));
        playback.stop();
        let report = playback.join().unwrap();

        assert!(report.frames_played >= 3);
        assert!(report.frames_played < 200);
        assert_eq!(playback.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let backend = MockBackend::default();
        let playback = FilePlayback::new(
            backend.as_backend(),
            PipelineConfig::default(),
            "/nonexistent/audio.wav",
        );
        playback.stop();
        assert_eq!(playback.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_file_capture_appends_and_prepare_clears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.wav");
        std::fs::write(&path, b"stale").unwrap();

        let capture = FileCapture::new(&path, IoErrorPolicy::LogAndContinue);
        capture.prepare().unwrap();
        assert!(!path.exists());
        capture.prepare().unwrap();

        capture.append(&[1, 2, 3]).unwrap();
        capture.append(&[4]).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4]);
    }
}
