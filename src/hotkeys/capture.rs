//! Interactive chord capture on evdev keyboards
//!
//! Records one simultaneous key combination: every press snapshots the held set,
//! and once every key is released the last snapshot is rendered canonically
//! (`Ctrl + Shift + Alt + K`). Used to produce binding tokens for the config.

use anyhow::{anyhow, Context, Result};
use evdev::{Device, EventSummary, KeyCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::constants::{input, paths, permissions};
use crate::keys::{KeyToken, Modifier};
use crate::lifecycle::{join_with_timeout, JoinOutcome};

/// Shared "a capture is in progress" flag, handed to whoever starts a capture
#[derive(Debug, Clone, Default)]
pub struct CaptureState {
    active: Arc<AtomicBool>,
}

impl CaptureState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_capturing(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim the capture slot; `None` while another capture holds it
    pub fn try_begin(&self) -> Option<CaptureGuard> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CaptureGuard { active: Arc::clone(&self.active) })
    }
}

/// Clears the capture flag when dropped
#[derive(Debug)]
pub struct CaptureGuard {
    active: Arc<AtomicBool>,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Press/release state machine for one capture session
#[derive(Debug, Default)]
pub struct ChordCapture {
    held: Vec<(u16, String)>,
    last_combo: Vec<(u16, String)>,
}

impl ChordCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key going down. Repeated presses of a held key are ignored.
    pub fn press(&mut self, code: u16, name: impl Into<String>) {
        if self.held.iter().any(|(held, _)| *held == code) {
            return;
        }
        self.held.push((code, name.into()));
        self.last_combo = self.held.clone();
    }

    /// Record a key going up; yields the rendered combination once nothing is held
    pub fn release(&mut self, code: u16) -> Option<String> {
        self.held.retain(|(held, _)| *held != code);
        if !self.held.is_empty() || self.last_combo.is_empty() {
            return None;
        }
        let combo = std::mem::take(&mut self.last_combo);
        Some(render_combo(&combo))
    }
}

fn render_combo(combo: &[(u16, String)]) -> String {
    let names: Vec<&str> = combo.iter().map(|(_, name)| name.as_str()).collect();

    let modifiers = Modifier::CANONICAL_ORDER
        .iter()
        .map(|m| m.name())
        .filter(|m| names.contains(m));
    let keys = names
        .iter()
        .copied()
        .filter(|name| Modifier::from_name(name).is_none());

    modifiers.chain(keys).collect::<Vec<_>>().join(" + ")
}

/// Token name for an evdev key code; left/right modifiers share one name
pub fn key_name(code: KeyCode) -> String {
    let modifier = match code {
        KeyCode::KEY_LEFTCTRL | KeyCode::KEY_RIGHTCTRL => Some(Modifier::Ctrl),
        KeyCode::KEY_LEFTSHIFT | KeyCode::KEY_RIGHTSHIFT => Some(Modifier::Shift),
        KeyCode::KEY_LEFTALT | KeyCode::KEY_RIGHTALT => Some(Modifier::Alt),
        KeyCode::KEY_LEFTMETA | KeyCode::KEY_RIGHTMETA => Some(Modifier::Win),
        _ => None,
    };
    if let Some(modifier) = modifier {
        return modifier.name().to_string();
    }

    let raw = format!("{:?}", code);
    let stripped = raw.strip_prefix("KEY_").unwrap_or(&raw);
    let alias = match stripped {
        "ESC" => "Escape",
        other => other,
    };
    KeyToken::parse(alias)
        .map(|token| token.name().to_string())
        .unwrap_or_else(|_| alias.to_string())
}

#[derive(Debug)]
struct KeyTransition {
    code: u16,
    name: String,
    pressed: bool,
}

/// Help text for a user who cannot read evdev nodes
fn input_access_help() -> String {
    format!(
        "Hotkey capture reads {} and requires membership in the '{}' group:\n  {}\nThen log out and back in.",
        paths::DEV_INPUT,
        permissions::INPUT_GROUP,
        permissions::ADD_TO_INPUT_GROUP
    )
}

/// Fail early, with setup instructions, when evdev nodes are not readable
pub fn ensure_input_access() -> Result<()> {
    std::fs::read_dir(paths::DEV_INPUT)
        .map(|_| ())
        .with_context(input_access_help)
}

/// Find all keyboard devices (anything that reports a Tab key)
fn find_keyboard_devices() -> Result<Vec<Device>> {
    info!(path = %paths::DEV_INPUT, "Scanning for keyboard devices...");

    let mut devices = Vec::new();
    let entries = std::fs::read_dir(paths::DEV_INPUT).with_context(input_access_help)?;

    for entry in entries {
        let path = entry?.path();
        let Ok(mut device) = Device::open(&path) else {
            continue;
        };
        if device.supported_keys().is_some_and(|keys| keys.contains(KeyCode::KEY_TAB)) {
            device
                .set_nonblocking(true)
                .with_context(|| format!("Failed to make {} non-blocking", path.display()))?;
            debug!(device_path = %path.display(), name = ?device.name(), "Found keyboard device");
            devices.push(device);
        }
    }

    if devices.is_empty() {
        anyhow::bail!("No keyboard device found. {}", input_access_help())
    }

    info!(count = devices.len(), "Capturing from keyboard device(s)");
    Ok(devices)
}

/// Forward transitions from `fetch` until `stop` is set or the receiver is gone.
///
/// `fetch` must not block: `WouldBlock` means nothing is queued yet.
fn pump_transitions<F>(mut fetch: F, sender: Sender<KeyTransition>, stop: Arc<AtomicBool>) -> Result<()>
where
    F: FnMut() -> io::Result<Vec<KeyTransition>>,
{
    while !stop.load(Ordering::SeqCst) {
        match fetch() {
            Ok(transitions) => {
                for transition in transitions {
                    if sender.send(transition).is_err() {
                        return Ok(());
                    }
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                thread::sleep(Duration::from_millis(input::CAPTURE_POLL_INTERVAL_MS));
            }
            Err(e) => return Err(e).context("Failed to fetch events"),
        }
    }
    Ok(())
}

fn read_transitions(device: &mut Device) -> io::Result<Vec<KeyTransition>> {
    let mut transitions = Vec::new();
    for event in device.fetch_events()? {
        let EventSummary::Key(_, code, value) = event.destructure() else {
            continue;
        };
        let pressed = match value {
            input::KEY_PRESS => true,
            input::KEY_RELEASE => false,
            _ => continue,
        };
        debug!(key = ?code, pressed = pressed, "Capture key event");
        transitions.push(KeyTransition { code: code.code(), name: key_name(code), pressed });
    }
    Ok(transitions)
}

/// Raise `stop` and wait for every listener, so no device stays open past the capture
fn stop_listeners(stop: &AtomicBool, listeners: Vec<JoinHandle<()>>) {
    stop.store(true, Ordering::SeqCst);
    let timeout = Duration::from_millis(input::CAPTURE_JOIN_TIMEOUT_MS);
    for handle in listeners {
        if !matches!(join_with_timeout("chord-capture", handle, timeout), JoinOutcome::Joined(())) {
            warn!("Capture listener did not exit cleanly");
        }
    }
}

fn spawn_listeners(
    devices: Vec<Device>,
    sender: &Sender<KeyTransition>,
    stop: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut listeners = Vec::with_capacity(devices.len());
    for mut device in devices {
        let sender = sender.clone();
        let thread_stop = Arc::clone(stop);
        let spawned = thread::Builder::new().name("chord-capture".into()).spawn(move || {
            if let Err(e) = pump_transitions(|| read_transitions(&mut device), sender, thread_stop) {
                error!(error = %e, "Capture listener error");
            }
        });
        match spawned {
            Ok(handle) => listeners.push(handle),
            Err(e) => {
                stop_listeners(stop, listeners);
                return Err(e).context("Failed to spawn capture listener thread");
            }
        }
    }
    Ok(listeners)
}

/// Block until one combination is pressed and fully released.
///
/// Listener threads are stopped and joined before this returns, and only then
/// is the capture slot released. `timeout` of `None` waits forever.
pub fn begin_capture(state: &CaptureState, timeout: Option<Duration>) -> Result<String> {
    let guard = state
        .try_begin()
        .ok_or_else(|| anyhow!("A hotkey capture is already in progress"))?;

    let devices = find_keyboard_devices()?;
    let (sender, receiver) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let listeners = spawn_listeners(devices, &sender, &stop)?;
    drop(sender);

    let result = collect_chord(&receiver, timeout);

    stop_listeners(&stop, listeners);
    drop(guard);
    match &result {
        Ok(combo) => info!(combination = %combo, "Captured key combination"),
        Err(e) => warn!(error = %e, "Hotkey capture ended without a result"),
    }
    result
}

fn collect_chord(receiver: &Receiver<KeyTransition>, timeout: Option<Duration>) -> Result<String> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut capture = ChordCapture::new();
    info!("Press and release a key combination...");

    loop {
        let transition = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(remaining) {
                    Ok(t) => t,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(anyhow!("No key combination captured within {:?}", timeout.unwrap_or_default()));
                    }
                    Err(RecvTimeoutError::Disconnected) => return Err(anyhow!("All keyboard listeners stopped")),
                }
            }
            None => receiver.recv().map_err(|_| anyhow!("All keyboard listeners stopped"))?,
        };

        if transition.pressed {
            capture.press(transition.code, transition.name);
        } else if let Some(combo) = capture.release(transition.code) {
            return Ok(combo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const CTRL: u16 = 29;
    const SHIFT: u16 = 42;
    const ALT: u16 = 56;
    const RIGHT_CTRL: u16 = 97;
    const K: u16 = 37;
    const J: u16 = 36;

    #[test]
    fn test_canonical_order_regardless_of_press_order() {
        let mut capture = ChordCapture::new();
        capture.press(SHIFT, "Shift");
        capture.press(ALT, "Alt");
        capture.press(CTRL, "Ctrl");
        capture.press(K, "K");

        assert_eq!(capture.release(K), None);
        assert_eq!(capture.release(CTRL), None);
        assert_eq!(capture.release(ALT), None);
        assert_eq!(capture.release(SHIFT).as_deref(), Some("Ctrl + Shift + Alt + K"));
    }

    #[test]
    fn test_result_is_last_full_snapshot() {
        let mut capture = ChordCapture::new();
        capture.press(CTRL, "Ctrl");
        capture.press(K, "K");
        capture.release(K);
        // Snapshot only changes on press, so releasing K keeps Ctrl + K
        assert_eq!(capture.release(CTRL).as_deref(), Some("Ctrl + K"));
    }

    #[test]
    fn test_multiple_keys_keep_encounter_order() {
        let mut capture = ChordCapture::new();
        capture.press(J, "J");
        capture.press(CTRL, "Ctrl");
        capture.press(K, "K");
        capture.release(J);
        capture.release(K);
        assert_eq!(capture.release(CTRL).as_deref(), Some("Ctrl + J + K"));
    }

    #[test]
    fn test_left_and_right_modifier_are_distinct_held_keys() {
        let mut capture = ChordCapture::new();
        capture.press(CTRL, "Ctrl");
        capture.press(RIGHT_CTRL, "Ctrl");
        capture.press(K, "K");
        capture.release(K);
        assert_eq!(capture.release(CTRL), None);
        assert_eq!(capture.release(RIGHT_CTRL).as_deref(), Some("Ctrl + K"));
    }

    #[test]
    fn test_repeat_press_and_stray_release_ignored() {
        let mut capture = ChordCapture::new();
        assert_eq!(capture.release(K), None);
        capture.press(K, "K");
        capture.press(K, "K");
        assert_eq!(capture.release(K).as_deref(), Some("K"));
        // Session resets after producing a result
        assert_eq!(capture.release(K), None);
    }

    #[test]
    fn test_key_names_match_config_tokens() {
        assert_eq!(key_name(KeyCode::KEY_RIGHTCTRL), "Ctrl");
        assert_eq!(key_name(KeyCode::KEY_LEFTMETA), "Win");
        assert_eq!(key_name(KeyCode::KEY_K), "K");
        assert_eq!(key_name(KeyCode::KEY_7), "7");
        assert_eq!(key_name(KeyCode::KEY_F5), "F5");
        assert_eq!(key_name(KeyCode::KEY_ESC), "Escape");
        assert_eq!(key_name(KeyCode::KEY_PAGEDOWN), "PageDown");
    }

    fn transition(code: u16, name: &str, pressed: bool) -> KeyTransition {
        KeyTransition { code, name: name.to_string(), pressed }
    }

    fn would_block() -> io::Error {
        io::Error::from(io::ErrorKind::WouldBlock)
    }

    #[test]
    fn test_idle_listener_exits_once_stopped() {
        let (sender, receiver) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let polls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&polls);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let fetch = move || -> io::Result<Vec<KeyTransition>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(would_block())
            };
            if let Err(e) = pump_transitions(fetch, sender, thread_stop) {
                panic!("listener failed: {e}");
            }
        });
        while polls.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }

        // No key event arrives, yet the listener still exits and drops its sender
        stop_listeners(&stop, vec![handle]);
        assert!(receiver.recv().is_err());
    }

    #[test]
    fn test_listener_forwards_queued_transitions() {
        let (sender, receiver) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let batch: io::Result<Vec<KeyTransition>> = Ok(vec![transition(K, "K", true), transition(K, "K", false)]);
        let mut batches = vec![batch].into_iter();

        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let fetch = move || batches.next().unwrap_or_else(|| Err(would_block()));
            pump_transitions(fetch, sender, thread_stop).unwrap();
        });

        assert_eq!(collect_chord(&receiver, Some(Duration::from_secs(5))).unwrap(), "K");
        stop_listeners(&stop, vec![handle]);
        assert!(receiver.recv().is_err());
    }

    #[test]
    fn test_device_error_ends_listener() {
        let (sender, _receiver) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let fetch = || -> io::Result<Vec<KeyTransition>> { Err(io::Error::from(io::ErrorKind::NotFound)) };
        assert!(pump_transitions(fetch, sender, stop).is_err());
    }

    #[test]
    fn test_collect_chord_times_out() {
        let (_sender, receiver) = mpsc::channel::<KeyTransition>();
        let err = collect_chord(&receiver, Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.to_string().contains("No key combination captured"));
    }

    #[test]
    fn test_collect_chord_reports_stopped_listeners() {
        let (sender, receiver) = mpsc::channel();
        sender.send(transition(CTRL, "Ctrl", true)).unwrap();
        drop(sender);
        assert!(collect_chord(&receiver, None).is_err());
    }

    #[test]
    fn test_access_help_names_group_and_command() {
        let help = input_access_help();
        assert!(help.contains(paths::DEV_INPUT));
        assert!(help.contains(permissions::ADD_TO_INPUT_GROUP));
    }

    #[test]
    fn test_capture_state_allows_one_session() {
        let state = CaptureState::new();
        let guard = state.try_begin();
        assert!(guard.is_some());
        assert!(state.is_capturing());
        assert!(state.clone().try_begin().is_none());
        drop(guard);
        assert!(!state.is_capturing());
        assert!(state.try_begin().is_some());
    }
}
