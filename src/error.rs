//! Error types shared by the audio pipelines

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by an audio device (capture source or playback sink)
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No default {0} device available")]
    NoDevice(&'static str),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Failed to query device config: {0}")]
    Config(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to build stream: {0}")]
    Build(String),

    #[error("Failed to start stream: {0}")]
    Play(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Device produced no data for {0} ms")]
    Stalled(u64),

    #[error("Device closed: {0}")]
    Closed(&'static str),
}

/// Errors surfaced by capture and playback pipelines
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(DeviceError),

    #[error("Audio device I/O failed: {0}")]
    Device(#[from] DeviceError),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid pipeline config: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn pipeline thread: {0}")]
    Spawn(std::io::Error),

    #[error("Playback ended while capture was still running")]
    PlaybackEnded,

    #[error("Pipeline thread panicked")]
    ThreadPanicked,
}

pub type PipelineResult<T> = Result<T, PipelineError>;
