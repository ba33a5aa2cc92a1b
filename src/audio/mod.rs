//! Audio module - capture, buffering and playback pipelines
//!
//! This module provides:
//! - Frames and the frame queue shared between capture and playback threads
//! - Device traits plus a cpal implementation
//! - The capture pipeline (live delayed playback or file recording)
//! - The playback pipeline (live queue or file)

mod capture;
mod cpal_backend;
mod device;
mod file;
mod frame;
mod handle;
mod playback;
mod queue;

#[cfg(test)]
pub(crate) mod mock;

pub use capture::{CapturePipeline, CaptureReport, CaptureState, CaptureTarget};
pub use cpal_backend::{list_devices, CpalBackend, DeviceList};
pub use device::{AudioBackend, AudioSink, AudioSource, DeviceFormat};
pub use file::{FileCapture, FileFeed, FilePlayback, IoErrorPolicy};
pub use frame::{CaptureBuffer, CopyStrategy, Frame};
pub use handle::{CancellationToken, CompletionCallback, PipelineKind};
pub use playback::{FrameFeed, PlaybackPipeline, PlaybackReport, PlaybackState, QueueFeed};
pub use queue::{FrameQueue, QueueItem};
