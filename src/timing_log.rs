//! Elapsed-time log written at every text boundary
//!
//! Each boundary appends `—H:MM:SS` (omitted when nothing elapsed) followed by
//! `<text>: H:MM:SS`. The first write failure disables logging for the rest of the run.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::constants::timing_log::ELAPSED_PREFIX;

/// Destination for timing log lines
pub trait LogSink {
    fn append(&mut self, lines: &[String]) -> Result<()>;
}

/// Appends to a file, reopened for every boundary so external truncation is harmless
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LogSink for FileSink {
    fn append(&mut self, lines: &[String]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open timing log {}", self.path.display()))?;
        for line in lines {
            writeln!(file, "{}", line).with_context(|| format!("Failed to write timing log {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// `H:MM:SS`, hours unpadded
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Lines for one boundary
pub fn boundary_lines(text: &str, elapsed: Duration) -> Vec<String> {
    let stamp = format_elapsed(elapsed);
    let mut lines = Vec::with_capacity(2);
    if elapsed.as_secs() != 0 {
        lines.push(format!("{}{}", ELAPSED_PREFIX, stamp));
    }
    lines.push(format!("{}: {}", text, stamp));
    lines
}

pub struct TimingLog<S: LogSink> {
    sink: Option<S>,
    origin: Instant,
}

impl<S: LogSink> TimingLog<S> {
    /// `sink` of `None` means logging is off for this run
    pub fn new(sink: Option<S>, now: Instant) -> Self {
        Self { sink, origin: now }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn sink(&self) -> Option<&S> {
        self.sink.as_ref()
    }

    /// Log how long `text` was shown and start timing the next one
    pub fn record(&mut self, text: &str, now: Instant) {
        let elapsed = now.saturating_duration_since(self.origin);
        self.origin = now;
        self.write(text, elapsed);
    }

    /// Reset the origin to `now` and write a zero-duration marker for `text`
    pub fn start_timer(&mut self, text: &str, now: Instant) {
        self.origin = now;
        info!(text = %text, "Timer started");
        self.write(text, Duration::ZERO);
    }

    fn write(&mut self, text: &str, elapsed: Duration) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let lines = boundary_lines(text, elapsed);
        match sink.append(&lines) {
            Ok(()) => debug!(text = %text, elapsed = %format_elapsed(elapsed), "Timing log entry written"),
            Err(e) => {
                error!(error = %e, "Timing log write failed, logging disabled for this run");
                self.sink = None;
            }
        }
    }
}
