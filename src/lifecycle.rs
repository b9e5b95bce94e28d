//! Actor threads: start-up handshake, release-once guards, bounded joins

use anyhow::{anyhow, Context, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::event_loop::StopSignal;

/// Flag that lets a release path run exactly once
#[derive(Debug, Default)]
pub struct ReleaseOnce {
    released: AtomicBool,
}

impl ReleaseOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for the first caller only
    pub fn claim(&self) -> bool {
        self.released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum JoinOutcome<T> {
    Joined(T),
    Panicked,
    TimedOut,
}

/// Join `handle`, giving up after `timeout`. Never blocks longer than that;
/// an abandoned thread keeps running detached.
pub fn join_with_timeout<T: Send + 'static>(name: &str, handle: JoinHandle<T>, timeout: Duration) -> JoinOutcome<T> {
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = done_tx.send(handle.join());
    });

    match done_rx.recv_timeout(timeout) {
        Ok(Ok(value)) => {
            info!(actor = name, "Actor thread joined");
            JoinOutcome::Joined(value)
        }
        Ok(Err(_)) => {
            error!(actor = name, "Actor thread panicked");
            JoinOutcome::Panicked
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(actor = name, timeout_ms = timeout.as_millis() as u64, "Actor thread join timed out, continuing shutdown");
            JoinOutcome::TimedOut
        }
        Err(RecvTimeoutError::Disconnected) => {
            error!(actor = name, "Actor join channel disconnected");
            JoinOutcome::Panicked
        }
    }
}

/// Start-up handshake end held by the actor thread
pub struct Startup<T> {
    tx: Option<Sender<Result<T>>>,
}

impl<T> Startup<T> {
    /// Report successful construction with the value the coordinator needs
    pub fn ready(&mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(value));
        }
    }

    fn fail(&mut self, error: Error) -> Option<Error> {
        match self.tx.take() {
            Some(tx) => tx.send(Err(error)).err().and_then(|e| e.0.err()),
            None => Some(error),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.tx.is_some()
    }
}

/// A running actor thread with its stop flag
pub struct ActorHandle {
    name: &'static str,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl ActorHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn request_stop(&self) {
        self.stop.request();
    }

    /// Bounded join; later calls are no-ops
    pub fn join(&mut self, timeout: Duration) {
        if let Some(thread) = self.thread.take() {
            join_with_timeout(self.name, thread, timeout);
        }
    }
}

/// Spawn an actor thread and wait for its start-up handshake.
///
/// `body` builds the actor, calls `Startup::ready`, then runs its loop. An error
/// before `ready` is returned from here; an error after it goes to `on_fatal`.
pub fn spawn_actor<T, F, R>(
    name: &'static str,
    stop: StopSignal,
    startup_timeout: Duration,
    join_timeout: Duration,
    on_fatal: R,
    body: F,
) -> Result<(ActorHandle, T)>
where
    T: Send + 'static,
    F: FnOnce(&mut Startup<T>, StopSignal) -> Result<()> + Send + 'static,
    R: FnOnce(Error) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let thread_stop = stop.clone();
    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut startup = Startup { tx: Some(tx) };
            if let Err(e) = body(&mut startup, thread_stop)
                && let Some(e) = startup.fail(e)
            {
                error!(actor = name, error = %format!("{e:#}"), "Actor stopped with a fatal error");
                on_fatal(e);
            }
        })
        .with_context(|| format!("Failed to spawn {} thread", name))?;

    let mut handle = ActorHandle {
        name,
        stop,
        thread: Some(thread),
    };

    let failure = match rx.recv_timeout(startup_timeout) {
        Ok(Ok(value)) => {
            info!(actor = name, "Actor started");
            return Ok((handle, value));
        }
        Ok(Err(e)) => e.context(format!("{} failed to start", name)),
        Err(RecvTimeoutError::Timeout) => {
            anyhow!("{} did not finish start-up within {:?}", name, startup_timeout)
        }
        Err(RecvTimeoutError::Disconnected) => anyhow!("{} thread exited during start-up", name),
    };

    handle.request_stop();
    handle.join(join_timeout);
    Err(failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const SHORT: Duration = Duration::from_millis(200);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_release_once() {
        let guard = ReleaseOnce::new();
        assert!(!guard.is_released());
        assert!(guard.claim());
        assert!(!guard.claim());
        assert!(guard.is_released());
    }

    #[test]
    fn test_join_with_timeout_outcomes() {
        let quick = thread::spawn(|| 7);
        assert!(matches!(join_with_timeout("quick", quick, LONG), JoinOutcome::Joined(7)));

        let panicking = thread::spawn(|| panic!("boom"));
        assert!(matches!(join_with_timeout("panicking", panicking, LONG), JoinOutcome::Panicked));

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let stuck = thread::spawn(move || {
            let _ = release_rx.recv();
        });
        assert!(matches!(join_with_timeout("stuck", stuck, Duration::from_millis(20)), JoinOutcome::TimedOut));
        drop(release_tx);
    }

    #[test]
    fn test_spawn_actor_handshake_and_stop() {
        let (mut handle, value) = spawn_actor("worker", StopSignal::new(), LONG, LONG, |_| {}, |startup, stop| {
            startup.ready(vec!["a".to_string()]);
            while !stop.is_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(value, vec!["a".to_string()]);
        handle.request_stop();
        handle.join(LONG);
        // Second join is a no-op
        handle.join(LONG);
    }

    #[test]
    fn test_spawn_actor_startup_error_propagates() {
        let fatal = Arc::new(Mutex::new(false));
        let fatal_seen = Arc::clone(&fatal);
        let result: Result<(ActorHandle, ())> = spawn_actor(
            "broken",
            StopSignal::new(),
            LONG,
            LONG,
            move |_| *fatal_seen.lock().unwrap() = true,
            |_, _| anyhow::bail!("window class registration failed"),
        );
        let err = result.err().unwrap();
        assert!(format!("{err:#}").contains("window class registration failed"));
        // Start-up failures go to the caller, not the fatal hook
        assert!(!*fatal.lock().unwrap());
    }

    #[test]
    fn test_spawn_actor_startup_timeout() {
        let stop = StopSignal::new();
        let result: Result<(ActorHandle, ())> = spawn_actor("slow", stop.clone(), SHORT, LONG, |_| {}, |_, stop| {
            while !stop.is_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        });
        assert!(result.is_err());
        assert!(stop.is_requested());
    }

    #[test]
    fn test_runtime_error_after_ready_reaches_fatal_hook() {
        let (fatal_tx, fatal_rx) = mpsc::channel();
        let (mut handle, ()) = spawn_actor(
            "failing",
            StopSignal::new(),
            LONG,
            LONG,
            move |e| {
                let _ = fatal_tx.send(e.to_string());
            },
            |startup, _| {
                startup.ready(());
                anyhow::bail!("connection lost")
            },
        )
        .unwrap();
        assert_eq!(fatal_rx.recv_timeout(LONG).unwrap(), "connection lost");
        handle.join(LONG);
    }
}
