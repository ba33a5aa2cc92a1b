//! Command-line interface
//!
//! Handles argument parsing and logging configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use loopback_rs::audio::{CopyStrategy, IoErrorPolicy};
use loopback_rs::AppSettings;

/// loopback-rs - hear your microphone after a fixed delay
#[derive(Parser, Debug)]
#[command(name = "loopback-rs")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Capture device name (default: host default)
    #[arg(long, global = true)]
    pub input_device: Option<String>,

    /// Playback device name (default: host default)
    #[arg(long, global = true)]
    pub output_device: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture the microphone and play it back after a delay
    Loopback {
        /// Buffering delay before playback starts
        #[arg(long)]
        delay_ms: Option<u32>,

        /// Stop after this many seconds instead of waiting for Enter
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Record raw PCM from the microphone to a file
    Record {
        /// Output file (headerless 16-bit PCM)
        #[arg(long)]
        path: Option<PathBuf>,

        /// How frames are copied out of the capture buffer
        #[arg(long, value_enum)]
        copy: Option<CopyStrategy>,

        /// What to do when a write to the file fails
        #[arg(long, value_enum)]
        on_io_error: Option<IoErrorPolicy>,

        #[arg(long)]
        duration: Option<u64>,
    },

    /// Play a raw PCM recording
    Play {
        #[arg(long)]
        path: Option<PathBuf>,

        #[arg(long)]
        duration: Option<u64>,
    },

    /// List audio devices
    Devices,

    /// Print the effective settings
    Settings {
        /// Also write them to the settings file
        #[arg(long)]
        save: bool,
    },
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Fold command-line overrides into the loaded settings
    pub fn apply(&self, settings: &mut AppSettings) {
        if self.input_device.is_some() {
            settings.input_device = self.input_device.clone();
        }
        if self.output_device.is_some() {
            settings.output_device = self.output_device.clone();
        }

        match &self.command {
            Command::Loopback { delay_ms, .. } => {
                if let Some(delay_ms) = delay_ms {
                    settings.pipeline.playback_delay_ms = *delay_ms;
                }
            }
            Command::Record {
                path,
                copy,
                on_io_error,
                ..
            } => {
                if let Some(path) = path {
                    settings.recording_path = path.clone();
                }
                if let Some(copy) = copy {
                    settings.copy_strategy = *copy;
                }
                if let Some(policy) = on_io_error {
                    settings.io_error_policy = *policy;
                }
            }
            Command::Play { path, .. } => {
                if let Some(path) = path {
                    settings.recording_path = path.clone();
                }
            }
            Command::Devices | Command::Settings { .. } => {}
        }
    }

    /// Time limit for commands that take `--duration`
    pub fn duration(&self) -> Option<Duration> {
        match &self.command {
            Command::Loopback { duration, .. }
            | Command::Record { duration, .. }
            | Command::Play { duration, .. } => duration.map(Duration::from_secs),
            Command::Devices | Command::Settings { .. } => None,
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("loopback_rs", args.log_level());

    // RUST_LOG still wins when set
    builder.parse_default_env();
    builder.format_timestamp_millis().init();
}
