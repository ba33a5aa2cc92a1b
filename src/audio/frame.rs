//! Audio frames and the reusable capture buffer
//!
//! A [`Frame`] is one chunk of raw 16-bit PCM as it travels from the capture
//! thread to the playback thread. Frames are immutable: the producer hands
//! ownership to the queue and the consumer takes it back out.
//!
//! The capture loop reads into a [`CaptureBuffer`], a view into larger backing
//! storage, and a [`CopyStrategy`] decides how the valid bytes are copied out.

use serde::{Deserialize, Serialize};

/// One immutable chunk of raw audio
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Box<[u8]>,
}

impl Frame {
    pub fn new(data: impl Into<Box<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for Frame {
    fn from(data: &[u8]) -> Self {
        Self::new(data)
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Reusable read buffer: a window of `capacity` bytes starting at `offset`
/// inside the backing storage
#[derive(Debug)]
pub struct CaptureBuffer {
    backing: Vec<u8>,
    offset: usize,
    capacity: usize,
}

impl CaptureBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_offset(capacity, 0)
    }

    /// Buffer whose view starts `offset` bytes into the backing storage
    pub fn with_offset(capacity: usize, offset: usize) -> Self {
        Self {
            backing: vec![0; offset + capacity],
            offset,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The readable window
    pub fn view(&self) -> &[u8] {
        &self.backing[self.offset..self.offset + self.capacity]
    }

    /// The writable window handed to the device read
    pub fn view_mut(&mut self) -> &mut [u8] {
        &mut self.backing[self.offset..self.offset + self.capacity]
    }

    /// The whole backing storage, including bytes before the window
    pub fn backing(&self) -> &[u8] {
        &self.backing
    }
}

/// How the valid bytes of a read are copied out of the [`CaptureBuffer`]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum CopyStrategy {
    /// Copy straight from the buffer's view
    #[default]
    Direct,
    /// Copy from the backing storage at the view's offset
    ArrayOffset,
    /// Copy from the start of the backing storage
    ///
    /// Only correct when the view starts at offset 0. A non-zero offset is
    /// corrected to the true offset and logged.
    ArrayZero,
}

impl CopyStrategy {
    /// The first `n_read` valid bytes of `buffer`; `n_read` is clamped to the
    /// buffer capacity
    pub fn valid_bytes<'a>(&self, buffer: &'a CaptureBuffer, n_read: usize) -> &'a [u8] {
        let n = n_read.min(buffer.capacity());
        match self {
            CopyStrategy::Direct => &buffer.view()[..n],
            CopyStrategy::ArrayOffset => {
                let start = buffer.offset();
                &buffer.backing()[start..start + n]
            }
            CopyStrategy::ArrayZero => {
                if buffer.offset() != 0 {
                    log::warn!(
                        "array-zero copy on a buffer with offset {}, copying from the true offset",
                        buffer.offset()
                    );
                    let start = buffer.offset();
                    return &buffer.backing()[start..start + n];
                }
                &buffer.backing()[..n]
            }
        }
    }
}
