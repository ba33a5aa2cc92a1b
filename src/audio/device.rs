//! Device abstraction used by the pipelines
//!
//! Pipelines never talk to an audio API directly. They ask an
//! [`AudioBackend`] to open a source or sink on their own thread and own the
//! returned object until the session ends; dropping it releases the device.

use crate::error::DeviceError;

/// Stream format requested from a device: 16-bit signed little-endian PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per read/write call
    pub frame_bytes: usize,
}

/// A capture device
pub trait AudioSource {
    /// Read up to `buf.len()` bytes, blocking until data is available.
    ///
    /// Returns the number of bytes written to `buf`, which may be less than
    /// requested near stream boundaries.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;
}

/// A playback device
pub trait AudioSink {
    /// Block until every byte of `bytes` has been accepted by the device
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;

    /// Drop audio queued inside the device ahead of the most recent write
    fn flush(&mut self) -> Result<(), DeviceError>;
}

/// Opens devices for the pipelines.
///
/// Sources and sinks are opened on the thread that uses them and are not
/// required to be `Send`.
pub trait AudioBackend: Send + Sync {
    fn open_source(&self, format: &DeviceFormat) -> Result<Box<dyn AudioSource>, DeviceError>;

    fn open_sink(&self, format: &DeviceFormat) -> Result<Box<dyn AudioSink>, DeviceError>;
}
