#![forbid(unsafe_code)]

mod compositor;
mod config;
mod constants;
mod coordinator;
mod cursor;
mod event_loop;
mod font;
mod hotkeys;
mod keys;
mod lifecycle;
mod overlay;
mod presentation;
mod timing_log;
mod x11_utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, Level as TraceLevel};
use tracing_subscriber::FmtSubscriber;

use config::Config;
use hotkeys::capture::{self, CaptureState};

/// Transparent cue-text overlay with global hotkeys and optional slide control
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/cue-overlay/settings.json)
    #[arg(short, long, global = true, value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the overlay (default)
    Run,

    /// Record one key combination from the keyboard and print it
    CaptureHotkey {
        /// Give up after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Print the default configuration
    DefaultConfig,
}

fn init_logging() -> anyhow::Result<()> {
    let log_level = match std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => TraceLevel::TRACE,
        "debug" => TraceLevel::DEBUG,
        "warn" => TraceLevel::WARN,
        "error" => TraceLevel::ERROR,
        _ => TraceLevel::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn capture_hotkey(timeout: Option<u64>) -> anyhow::Result<()> {
    capture::ensure_input_access()?;
    let combination = capture::begin_capture(&CaptureState::new(), timeout.map(Duration::from_secs))?;
    let tokens: Vec<&str> = combination.split(" + ").collect();
    println!("{}", combination);
    println!("{}", serde_json::to_string(&tokens)?);
    Ok(())
}

fn default_config() -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&Config::default())?);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!(version = env!("CARGO_PKG_VERSION"), "Starting cue-overlay");
            coordinator::run(cli.config.as_deref())
        }
        Commands::CaptureHotkey { timeout } => capture_hotkey(timeout),
        Commands::DefaultConfig => default_config(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Exiting with failure");
            ExitCode::FAILURE
        }
    }
}
