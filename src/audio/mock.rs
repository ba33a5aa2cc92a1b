//! In-memory backend for pipeline tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::device::{AudioBackend, AudioSink, AudioSource, DeviceFormat};
use crate::error::DeviceError;

/// Behaviour of a [`MockBackend`]
#[derive(Debug, Clone, Default)]
pub struct MockState {
    pub fail_source: bool,
    pub fail_sink: bool,
    /// Byte counts returned by successive reads, followed by empty reads.
    /// `None` reads full frames forever.
    pub script: Option<Vec<usize>>,
    /// Time each read takes (at least 1 ms)
    pub read_delay: Duration,
    pub write_delay: Duration,
    pub fail_read_after: Option<usize>,
    pub fail_write_after: Option<usize>,
}

struct Inner {
    state: MockState,
    script: Mutex<Option<VecDeque<usize>>>,
    reads: AtomicUsize,
    sources_opened: AtomicUsize,
    sinks_opened: AtomicUsize,
    writes: Mutex<Vec<Vec<u8>>>,
    flushes: AtomicUsize,
    reads_at_first_write: Mutex<Option<usize>>,
}

/// Scripted source and recording sink.
///
/// Every byte of the n-th successful read is `n % 251`, so frame order can be
/// checked from the first byte of each write.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<Inner>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(MockState::default())
    }
}

impl MockBackend {
    pub fn new(state: MockState) -> Self {
        let script = state.script.clone().map(VecDeque::from);
        Self {
            inner: Arc::new(Inner {
                state,
                script: Mutex::new(script),
                reads: AtomicUsize::new(0),
                sources_opened: AtomicUsize::new(0),
                sinks_opened: AtomicUsize::new(0),
                writes: Mutex::new(Vec::new()),
                flushes: AtomicUsize::new(0),
                reads_at_first_write: Mutex::new(None),
            }),
        }
    }

    pub fn as_backend(&self) -> Arc<dyn AudioBackend> {
        Arc::new(self.clone())
    }

    /// Successful non-empty reads so far
    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn sources_opened(&self) -> usize {
        self.inner.sources_opened.load(Ordering::SeqCst)
    }

    pub fn sinks_opened(&self) -> usize {
        self.inner.sinks_opened.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.inner.writes.lock().unwrap().len()
    }

    pub fn flushes(&self) -> usize {
        self.inner.flushes.load(Ordering::SeqCst)
    }

    /// How many reads had completed when the first write arrived
    pub fn reads_at_first_write(&self) -> Option<usize> {
        *self.inner.reads_at_first_write.lock().unwrap()
    }
}

impl AudioBackend for MockBackend {
    fn open_source(&self, _format: &DeviceFormat) -> Result<Box<dyn AudioSource>, DeviceError> {
        if self.inner.state.fail_source {
            return Err(DeviceError::NoDevice("input"));
        }
        self.inner.sources_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSource {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn open_sink(&self, _format: &DeviceFormat) -> Result<Box<dyn AudioSink>, DeviceError> {
        if self.inner.state.fail_sink {
            return Err(DeviceError::NoDevice("output"));
        }
        self.inner.sinks_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSink {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockSource {
    inner: Arc<Inner>,
}

impl AudioSource for MockSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        thread::sleep(self.inner.state.read_delay.max(Duration::from_millis(1)));

        let index = self.inner.reads.load(Ordering::SeqCst);
        if let Some(limit) = self.inner.state.fail_read_after {
            if index >= limit {
                return Err(DeviceError::Stream("injected read failure".to_string()));
            }
        }

        let n = match self.inner.script.lock().unwrap().as_mut() {
            Some(script) => script.pop_front().unwrap_or(0),
            None => buf.len(),
        }
        .min(buf.len());

        if n > 0 {
            buf[..n].fill((index % 251) as u8);
            self.inner.reads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(n)
    }
}

struct MockSink {
    inner: Arc<Inner>,
}

impl AudioSink for MockSink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        if !self.inner.state.write_delay.is_zero() {
            thread::sleep(self.inner.state.write_delay);
        }

        let mut writes = self.inner.writes.lock().unwrap();
        if let Some(limit) = self.inner.state.fail_write_after {
            if writes.len() >= limit {
                return Err(DeviceError::Stream("injected write failure".to_string()));
            }
        }
        if writes.is_empty() {
            *self.inner.reads_at_first_write.lock().unwrap() =
                Some(self.inner.reads.load(Ordering::SeqCst));
        }
        writes.push(bytes.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.inner.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
