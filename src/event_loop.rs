//! One loop driver shared by every actor and the coordinator
//!
//! A loop either blocks on its event source or polls it with a short sleep
//! between empty polls; in both modes the stop signal is checked once per iteration.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Cooperative stop flag shared between a loop and whoever may stop it
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Wait for each event; stop is only observed between events
    Blocking,
    /// Poll without blocking, sleeping `interval` whenever nothing is pending
    Polling { interval: Duration },
}

/// Outcome of handling (or looking for) one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// An event was handled; more may be queued
    Continue,
    /// Nothing was pending
    Idle,
    /// The source asked the loop to end
    Exit,
}

pub trait EventSource {
    /// Handle at most one pending event without blocking
    fn poll_once(&mut self) -> Result<Flow>;

    /// Block until an event arrives and handle it
    fn wait_once(&mut self) -> Result<Flow>;
}

/// Drive `source` until it exits, fails, or `stop` is requested
pub fn run_loop<E: EventSource + ?Sized>(name: &str, source: &mut E, mode: LoopMode, stop: &StopSignal) -> Result<()> {
    info!(actor = name, mode = ?mode, "Event loop started");
    loop {
        if stop.is_requested() {
            info!(actor = name, "Stop requested, leaving event loop");
            return Ok(());
        }

        let flow = match mode {
            LoopMode::Blocking => source.wait_once()?,
            LoopMode::Polling { .. } => source.poll_once()?,
        };

        match (flow, mode) {
            (Flow::Exit, _) => {
                info!(actor = name, "Event source finished, leaving event loop");
                return Ok(());
            }
            (Flow::Idle, LoopMode::Polling { interval }) => thread::sleep(interval),
            (Flow::Idle, LoopMode::Blocking) => debug!(actor = name, "Woken without an event"),
            (Flow::Continue, _) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed script of flows and counts calls per mode
    struct Scripted {
        script: VecDeque<Result<Flow>>,
        polls: usize,
        waits: usize,
        stop_after: Option<(usize, StopSignal)>,
    }

    impl Scripted {
        fn new(script: Vec<Result<Flow>>) -> Self {
            Self {
                script: script.into(),
                polls: 0,
                waits: 0,
                stop_after: None,
            }
        }

        fn next(&mut self) -> Result<Flow> {
            if let Some((n, stop)) = &self.stop_after
                && self.polls + self.waits >= *n
            {
                stop.request();
            }
            self.script.pop_front().unwrap_or(Ok(Flow::Exit))
        }
    }

    impl EventSource for Scripted {
        fn poll_once(&mut self) -> Result<Flow> {
            self.polls += 1;
            self.next()
        }

        fn wait_once(&mut self) -> Result<Flow> {
            self.waits += 1;
            self.next()
        }
    }

    fn polling() -> LoopMode {
        LoopMode::Polling { interval: Duration::from_millis(1) }
    }

    #[test]
    fn test_polling_runs_until_exit() {
        let mut source = Scripted::new(vec![Ok(Flow::Idle), Ok(Flow::Continue), Ok(Flow::Idle), Ok(Flow::Exit)]);
        run_loop("test", &mut source, polling(), &StopSignal::new()).unwrap();
        assert_eq!(source.polls, 4);
        assert_eq!(source.waits, 0);
    }

    #[test]
    fn test_blocking_uses_wait() {
        let mut source = Scripted::new(vec![Ok(Flow::Continue), Ok(Flow::Exit)]);
        run_loop("test", &mut source, LoopMode::Blocking, &StopSignal::new()).unwrap();
        assert_eq!(source.waits, 2);
        assert_eq!(source.polls, 0);
    }

    #[test]
    fn test_stop_checked_before_first_iteration() {
        let stop = StopSignal::new();
        stop.request();
        let mut source = Scripted::new(vec![Ok(Flow::Continue)]);
        run_loop("test", &mut source, polling(), &stop).unwrap();
        assert_eq!(source.polls, 0);
    }

    #[test]
    fn test_stop_observed_between_iterations() {
        let stop = StopSignal::new();
        let mut source = Scripted::new((0..100).map(|_| Ok(Flow::Idle)).collect());
        source.stop_after = Some((3, stop.clone()));
        run_loop("test", &mut source, polling(), &stop).unwrap();
        assert_eq!(source.polls, 3);
    }

    #[test]
    fn test_source_error_propagates() {
        let mut source = Scripted::new(vec![Ok(Flow::Idle), Err(anyhow::anyhow!("connection lost"))]);
        let err = run_loop("test", &mut source, polling(), &StopSignal::new()).unwrap_err();
        assert!(err.to_string().contains("connection lost"));
        assert_eq!(source.polls, 2);
    }
}
