//! cpal-backed capture and playback devices
//!
//! cpal drives audio through real-time callbacks, while the pipelines want
//! blocking `read`/`write_all` calls. Each device therefore pairs a cpal
//! stream with a `ringbuf` byte ring: the callback is the only party on one
//! end of the ring and the pipeline thread on the other, so neither side ever
//! takes a lock on the audio thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

use super::device::{AudioBackend, AudioSink, AudioSource, DeviceFormat};
use crate::error::DeviceError;

/// Frames of audio the capture ring can hold before the callback drops samples
const CAPTURE_RING_FRAMES: usize = 64;

/// Frames of audio the playback ring can hold ahead of the device
const PLAYBACK_RING_FRAMES: usize = 8;

/// A capture read with no data for this long fails with [`DeviceError::Stalled`]
const STALL_TIMEOUT: Duration = Duration::from_millis(2000);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Stream error reported by a cpal callback, read by the pipeline thread
type FailureSlot = Arc<Mutex<Option<String>>>;

fn take_failure(slot: &FailureSlot) -> Option<String> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Opens cpal devices on the default host, optionally by name
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }

    fn input(&self) -> Result<cpal::Device, DeviceError> {
        let host = cpal::default_host();
        match &self.input_device {
            Some(name) => host
                .input_devices()
                .map_err(|e| DeviceError::Config(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| DeviceError::NotFound(name.clone())),
            None => host
                .default_input_device()
                .ok_or(DeviceError::NoDevice("input")),
        }
    }

    fn output(&self) -> Result<cpal::Device, DeviceError> {
        let host = cpal::default_host();
        match &self.output_device {
            Some(name) => host
                .output_devices()
                .map_err(|e| DeviceError::Config(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| DeviceError::NotFound(name.clone())),
            None => host
                .default_output_device()
                .ok_or(DeviceError::NoDevice("output")),
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open_source(&self, format: &DeviceFormat) -> Result<Box<dyn AudioSource>, DeviceError> {
        let device = self.input()?;
        Ok(Box::new(CpalSource::open(&device, format)?))
    }

    fn open_sink(&self, format: &DeviceFormat) -> Result<Box<dyn AudioSink>, DeviceError> {
        let device = self.output()?;
        Ok(Box::new(CpalSink::open(&device, format)?))
    }
}

/// Names of the devices on the default host
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
}

pub fn list_devices() -> Result<DeviceList, DeviceError> {
    let host = cpal::default_host();
    let inputs = host
        .input_devices()
        .map_err(|e| DeviceError::Config(e.to_string()))?
        .filter_map(|d| d.name().ok())
        .collect();
    let outputs = host
        .output_devices()
        .map_err(|e| DeviceError::Config(e.to_string()))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(DeviceList {
        inputs,
        outputs,
        default_input: host.default_input_device().and_then(|d| d.name().ok()),
        default_output: host.default_output_device().and_then(|d| d.name().ok()),
    })
}

/// Stream config at our sample rate, keeping the device's native channel count
fn stream_config(channels: u16, format: &DeviceFormat) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Microphone capture delivering 16-bit LE mono bytes
pub struct CpalSource {
    _stream: cpal::Stream,
    consumer: HeapCons<u8>,
    failure: FailureSlot,
}

impl CpalSource {
    fn open(device: &cpal::Device, format: &DeviceFormat) -> Result<Self, DeviceError> {
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!("Using input device: {}", device_name);

        let supported = device
            .default_input_config()
            .map_err(|e| DeviceError::Config(e.to_string()))?;
        let config = stream_config(supported.channels(), format);
        log::debug!("Input config: {:?} ({:?})", config, supported.sample_format());

        let rb = HeapRb::<u8>::new(format.frame_bytes * CAPTURE_RING_FRAMES);
        let (producer, consumer) = rb.split();
        let failure = FailureSlot::default();

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                build_input::<f32>(device, &config, producer, Arc::clone(&failure))
            }
            cpal::SampleFormat::I16 => {
                build_input::<i16>(device, &config, producer, Arc::clone(&failure))
            }
            cpal::SampleFormat::U16 => {
                build_input::<u16>(device, &config, producer, Arc::clone(&failure))
            }
            other => Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
        }?;

        stream.play().map_err(|e| DeviceError::Play(e.to_string()))?;
        log::info!("Capture started on {}", device_name);

        Ok(Self {
            _stream: stream,
            consumer,
            failure,
        })
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<u8>,
    failure: FailureSlot,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut dropped: u64 = 0;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    // First channel only; a half-written sample would misalign the ring
                    if producer.vacant_len() < 2 {
                        dropped += 1;
                        continue;
                    }
                    let sample: i16 = frame[0].to_sample::<i16>();
                    producer.push_slice(&sample.to_le_bytes());
                }
                if dropped > 0 && dropped % 44100 == 0 {
                    log::warn!("Capture ring overrun, {} samples dropped", dropped);
                }
            },
            move |err| {
                log::error!("Audio input error: {}", err);
                *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
            },
            None,
        )
        .map_err(|e| DeviceError::Build(e.to_string()))
}

impl AudioSource for CpalSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let started = Instant::now();
        loop {
            if let Some(err) = take_failure(&self.failure) {
                return Err(DeviceError::Stream(err));
            }
            if self.consumer.occupied_len() >= buf.len() {
                return Ok(self.consumer.pop_slice(buf));
            }
            if started.elapsed() >= STALL_TIMEOUT {
                // Hand back whatever arrived rather than losing it
                let n = self.consumer.pop_slice(buf);
                if n > 0 {
                    return Ok(n);
                }
                return Err(DeviceError::Stalled(STALL_TIMEOUT.as_millis() as u64));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        log::info!("Capture stopped");
    }
}

/// Speaker playback accepting 16-bit LE mono bytes
pub struct CpalSink {
    _stream: cpal::Stream,
    producer: HeapProd<u8>,
    failure: FailureSlot,
    /// Total bytes handed to the ring
    written: u64,
    /// Total bytes the callback has played or skipped
    played: Arc<AtomicU64>,
    /// The callback skips everything before this byte position
    discard_until: Arc<AtomicU64>,
    last_write: u64,
    /// Odd byte held back from the previous write
    carry: Option<u8>,
    settle_timeout: Duration,
}

impl CpalSink {
    fn open(device: &cpal::Device, format: &DeviceFormat) -> Result<Self, DeviceError> {
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!("Using output device: {}", device_name);

        let supported = device
            .default_output_config()
            .map_err(|e| DeviceError::Config(e.to_string()))?;
        let config = stream_config(supported.channels(), format);
        log::debug!("Output config: {:?} ({:?})", config, supported.sample_format());

        let rb = HeapRb::<u8>::new(format.frame_bytes * PLAYBACK_RING_FRAMES);
        let (producer, consumer) = rb.split();
        let failure = FailureSlot::default();
        let played = Arc::new(AtomicU64::new(0));
        let discard_until = Arc::new(AtomicU64::new(0));

        let shared = OutputShared {
            consumer,
            played: Arc::clone(&played),
            discard_until: Arc::clone(&discard_until),
            failure: Arc::clone(&failure),
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_output::<f32>(device, &config, shared),
            cpal::SampleFormat::I16 => build_output::<i16>(device, &config, shared),
            cpal::SampleFormat::U16 => build_output::<u16>(device, &config, shared),
            other => Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
        }?;

        stream.play().map_err(|e| DeviceError::Play(e.to_string()))?;
        log::info!("Playback started on {}", device_name);

        // Two frames of wall time for the device to reach the newest write
        let frame_ms = (format.frame_bytes as u64 * 1000 / format.sample_rate.max(1) as u64).max(5);

        Ok(Self {
            _stream: stream,
            producer,
            failure,
            written: 0,
            played,
            discard_until,
            last_write: 0,
            carry: None,
            settle_timeout: Duration::from_millis(frame_ms * 2),
        })
    }
}

/// State moved into the output callback
struct OutputShared {
    consumer: HeapCons<u8>,
    played: Arc<AtomicU64>,
    discard_until: Arc<AtomicU64>,
    failure: FailureSlot,
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: OutputShared,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = config.channels.max(1) as usize;
    let OutputShared {
        mut consumer,
        played,
        discard_until,
        failure,
    } = shared;
    let mut position: u64 = 0;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let until = discard_until.load(Ordering::Acquire);
                if until > position {
                    let skip = ((until - position) as usize).min(consumer.occupied_len()) & !1;
                    position += consumer.skip(skip) as u64;
                }

                for frame in data.chunks_mut(channels) {
                    let mut bytes = [0u8; 2];
                    let sample = if consumer.occupied_len() >= 2 {
                        position += consumer.pop_slice(&mut bytes) as u64;
                        i16::from_le_bytes(bytes)
                    } else {
                        0
                    };
                    let value = T::from_sample(sample);
                    for ch in frame.iter_mut() {
                        *ch = value;
                    }
                }
                played.store(position, Ordering::Release);
            },
            move |err| {
                log::error!("Audio output error: {}", err);
                *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
            },
            None,
        )
        .map_err(|e| DeviceError::Build(e.to_string()))
}

impl AudioSink for CpalSink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let bytes = whole_samples(&mut self.carry, bytes);
        let mut remaining = &bytes[..];
        while !remaining.is_empty() {
            if let Some(err) = take_failure(&self.failure) {
                return Err(DeviceError::Stream(err));
            }
            let pushed = self.producer.push_slice(remaining);
            remaining = &remaining[pushed..];
            if !remaining.is_empty() {
                thread::sleep(POLL_INTERVAL);
            }
        }
        self.written += bytes.len() as u64;
        self.last_write = bytes.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        let backlog_end = self.written - self.last_write;
        let deadline = Instant::now() + self.settle_timeout;
        while self.played.load(Ordering::Acquire) < backlog_end {
            if let Some(err) = take_failure(&self.failure) {
                return Err(DeviceError::Stream(err));
            }
            if Instant::now() >= deadline {
                log::debug!("Dropping playback backlog up to byte {}", backlog_end);
                self.discard_until.store(backlog_end, Ordering::Release);
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

/// Join the byte held back from the last write onto `bytes`, and hold back a
/// trailing odd byte, so the ring only ever receives whole 16-bit samples
fn whole_samples(carry: &mut Option<u8>, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.extend(carry.take());
    out.extend_from_slice(bytes);
    if out.len() % 2 == 1 {
        *carry = out.pop();
    }
    out
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if self.carry.is_some() {
            log::debug!("Dropping trailing half sample at end of playback");
        }
        log::info!("Playback stopped");
    }
}
