//! loopback-rs - delayed microphone loopback
//!
//! Captures 16-bit mono audio in fixed-size frames, buffers a configurable
//! delay worth of frames, then plays them back on a separate thread. The same
//! capture loop can record raw PCM to a file, which can be played back later.

pub mod audio;
pub mod error;
pub mod settings;

pub use error::{DeviceError, PipelineError, PipelineResult};
pub use settings::{AppSettings, PipelineConfig};
