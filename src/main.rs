//! loopback-rs - delayed microphone loopback
//!
//! Command-line front end for the capture and playback pipelines:
//! - `loopback`: hear the microphone after the configured delay
//! - `record` / `play`: raw PCM file recording and playback
//! - `devices`, `settings`: inspection helpers

use std::io::BufRead;
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use loopback_rs::audio::{
    list_devices, AudioBackend, CaptureReport, CapturePipeline, CompletionCallback, CpalBackend,
    FileCapture, FilePlayback, PipelineKind, PlaybackReport,
};
use loopback_rs::{AppSettings, PipelineError, PipelineResult};

mod cli;

use cli::{Args, Command};

/// What the front end waits on while a pipeline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UiEvent {
    StopRequested,
    Complete(PipelineKind),
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(&args);
    log::info!("Starting loopback-rs");

    let mut settings = AppSettings::load();
    args.apply(&mut settings);

    match run(&args, &settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(PipelineError::FileNotFound(path)) => {
            log::warn!("Recording {} not found", path.display());
            eprintln!("Please record first.");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, settings: &AppSettings) -> PipelineResult<()> {
    let backend: Arc<dyn AudioBackend> = Arc::new(CpalBackend::new(
        settings.input_device.clone(),
        settings.output_device.clone(),
    ));

    match &args.command {
        Command::Loopback { .. } => run_loopback(backend, settings, args.duration()),
        Command::Record { .. } => run_record(backend, settings, args.duration()),
        Command::Play { .. } => run_play(backend, settings, args.duration()),
        Command::Devices => print_devices(),
        Command::Settings { save } => print_settings(settings, *save),
    }
}

/// Completion callback forwarding pipeline exits to the event loop
fn completion_events(events: &Sender<UiEvent>) -> CompletionCallback {
    let events = events.clone();
    Arc::new(move |kind| {
        log::debug!("{:?} pipeline complete", kind);
        let _ = events.send(UiEvent::Complete(kind));
    })
}

/// Turn a press of Enter into a stop request
fn watch_stdin(events: &Sender<UiEvent>) {
    let events = events.clone();
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let mut line = String::new();
            if std::io::stdin().lock().read_line(&mut line).is_ok() {
                let _ = events.send(UiEvent::StopRequested);
            }
        });
    if let Err(e) = spawned {
        log::warn!("Cannot watch stdin ({}), stop with Ctrl-C", e);
    }
}

/// Block until the user asks to stop, the time limit passes, or `finished`
/// completes on its own. Returns true when a stop should be requested.
fn wait_for_stop(
    events: &Receiver<UiEvent>,
    limit: Option<Duration>,
    finished: PipelineKind,
) -> bool {
    let deadline = limit.map(|d| Instant::now() + d);
    loop {
        let event = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match events.recv_timeout(remaining) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => return true,
                    Err(RecvTimeoutError::Disconnected) => return true,
                }
            }
            None => match events.recv() {
                Ok(event) => event,
                Err(_) => return true,
            },
        };

        match event {
            UiEvent::StopRequested => return true,
            UiEvent::Complete(kind) if kind == finished => return false,
            UiEvent::Complete(_) => {}
        }
    }
}

fn prompt(action: &str, limit: Option<Duration>) {
    match limit {
        Some(limit) => println!("{} for {} s...", action, limit.as_secs()),
        None => println!("{}, press Enter to stop...", action),
    }
}

fn run_loopback(
    backend: Arc<dyn AudioBackend>,
    settings: &AppSettings,
    limit: Option<Duration>,
) -> PipelineResult<()> {
    let (tx, rx) = mpsc::channel();
    let capture = CapturePipeline::delayed_playback(backend, settings.pipeline)
        .with_completion(completion_events(&tx));

    capture.start()?;
    prompt(
        &format!(
            "Looping back with {} ms delay",
            settings.pipeline.playback_delay_ms
        ),
        limit,
    );
    if limit.is_none() {
        watch_stdin(&tx);
    }

    if wait_for_stop(&rx, limit, PipelineKind::Capture) {
        capture.stop();
        log::debug!("{} frames still queued", capture.queued_frames());
    }
    match capture.join() {
        Some(report) => finish_capture(report),
        None => Ok(()),
    }
}

fn run_record(
    backend: Arc<dyn AudioBackend>,
    settings: &AppSettings,
    limit: Option<Duration>,
) -> PipelineResult<()> {
    let (tx, rx) = mpsc::channel();
    let file = FileCapture::new(&settings.recording_path, settings.io_error_policy);
    let capture = CapturePipeline::to_file(backend, settings.pipeline, file)
        .with_copy_strategy(settings.copy_strategy)
        .with_completion(completion_events(&tx));

    capture.start()?;
    prompt(
        &format!("Recording to {}", settings.recording_path.display()),
        limit,
    );
    if limit.is_none() {
        watch_stdin(&tx);
    }

    if wait_for_stop(&rx, limit, PipelineKind::Capture) {
        capture.stop();
    }
    match capture.join() {
        Some(report) => finish_capture(report),
        None => Ok(()),
    }
}

fn run_play(
    backend: Arc<dyn AudioBackend>,
    settings: &AppSettings,
    limit: Option<Duration>,
) -> PipelineResult<()> {
    let (tx, rx) = mpsc::channel();
    let mut playback = FilePlayback::new(backend, settings.pipeline, &settings.recording_path)
        .with_completion(completion_events(&tx));

    playback.start()?;
    prompt(
        &format!("Playing {}", settings.recording_path.display()),
        limit,
    );
    if limit.is_none() {
        watch_stdin(&tx);
    }

    if wait_for_stop(&rx, limit, PipelineKind::Playback) {
        playback.stop();
    }
    match playback.join() {
        Some(report) => finish_playback(report),
        None => Ok(()),
    }
}

fn finish_capture(report: CaptureReport) -> PipelineResult<()> {
    println!(
        "Captured {} frames ({} bytes)",
        report.frames_captured, report.bytes_captured
    );
    if report.io_errors > 0 {
        println!("{} frames could not be written", report.io_errors);
    }
    let playback_result = match report.playback {
        Some(playback) => finish_playback(playback),
        None => Ok(()),
    };
    match report.error {
        Some(err) => Err(err),
        None => playback_result,
    }
}

fn finish_playback(report: PlaybackReport) -> PipelineResult<()> {
    println!(
        "Played {} frames ({} bytes)",
        report.frames_played, report.bytes_played
    );
    match report.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn print_devices() -> PipelineResult<()> {
    let devices = list_devices().map_err(PipelineError::DeviceUnavailable)?;
    let mark = |name: &String, default: &Option<String>| {
        if default.as_ref() == Some(name) {
            " (default)"
        } else {
            ""
        }
    };

    println!("Input devices:");
    for name in &devices.inputs {
        println!("  {}{}", name, mark(name, &devices.default_input));
    }
    println!("Output devices:");
    for name in &devices.outputs {
        println!("  {}{}", name, mark(name, &devices.default_output));
    }
    Ok(())
}

fn print_settings(settings: &AppSettings, save: bool) -> PipelineResult<()> {
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
    println!("{}", json);
    println!(
        "# {} ms frames, playback starts after {} frames",
        settings.pipeline.frame_duration_ms(),
        settings.pipeline.delay_frames()
    );

    if save {
        let path = settings.save()?;
        println!("# saved to {}", path.display());
    } else {
        println!("# settings file: {}", loopback_rs::settings::settings_path().display());
    }
    Ok(())
}
