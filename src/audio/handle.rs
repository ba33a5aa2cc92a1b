//! Session plumbing shared by the pipelines: state cells, stop tokens,
//! completion callbacks and the thread startup handshake.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{DeviceError, PipelineError, PipelineResult};

/// Which pipeline finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Capture,
    Playback,
}

/// Invoked once each time a pipeline thread exits
pub type CompletionCallback = Arc<dyn Fn(PipelineKind) + Send + Sync>;

/// Cooperative stop signal, checked at the top of every loop iteration.
///
/// Cancelling never interrupts a device read, device write or queue wait that
/// is already in progress; the loop sees the request once that call returns.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Running,
            2 => Phase::Stopping,
            3 => Phase::Stopped,
            _ => Phase::Idle,
        }
    }
}

/// Atomic lifecycle state shared between a pipeline and its thread
#[derive(Debug, Clone)]
pub(crate) struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Phase::Idle as u8)))
    }

    pub fn load(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    pub fn transition(&self, from: Phase, to: Phase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the cell for a new session if nothing is running
    pub fn try_begin(&self) -> bool {
        self.transition(Phase::Idle, Phase::Running)
            || self.transition(Phase::Stopped, Phase::Running)
    }
}

/// Lets a pipeline thread report whether its device opened
pub(crate) struct Startup(mpsc::SyncSender<Result<(), DeviceError>>);

impl Startup {
    pub fn ready(&self) {
        let _ = self.0.send(Ok(()));
    }

    pub fn failed(&self, err: DeviceError) {
        let _ = self.0.send(Err(err));
    }
}

/// Spawn a named pipeline thread and wait until it reports its device open.
///
/// The device is opened on the new thread because cpal streams cannot move
/// between threads. A failed open is returned as
/// [`PipelineError::DeviceUnavailable`] after the thread has been joined.
pub(crate) fn spawn_with_startup<T, F>(name: &str, body: F) -> PipelineResult<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce(Startup) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(Startup(tx)))
        .map_err(PipelineError::Spawn)?;

    match rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(PipelineError::DeviceUnavailable(err))
        }
        Err(_) => {
            let _ = handle.join();
            Err(PipelineError::DeviceUnavailable(DeviceError::Closed(
                "pipeline thread exited before opening its device",
            )))
        }
    }
}
