//! External slide viewer: process, top-level window and key injection

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;

use super::PresentationHost;
use crate::constants::timing::WINDOW_LOOKUP_INTERVAL_MS;
use crate::hotkeys::x11::X11Backend;
use crate::hotkeys::synthesize_unmodified;
use crate::keys::Combination;
use crate::lifecycle::ReleaseOnce;
use crate::x11_utils::{
    activate_window, close_window, find_window_by_class, lower_window, maximize_window, restore_window, CachedAtoms,
};

#[derive(Debug, Clone)]
pub struct ViewerSettings {
    /// Program and leading arguments; the deck path is appended
    pub command: Vec<String>,
    pub window_class: String,
    pub window_timeout: Duration,
    pub next_keys: Combination,
    pub previous_keys: Combination,
}

pub fn viewer_command(command: &[String], deck: &Path) -> Result<Command> {
    let Some((program, args)) = command.split_first() else {
        bail!("Viewer command is empty");
    };
    let mut cmd = Command::new(program);
    cmd.args(args).arg(deck);
    Ok(cmd)
}

fn stop_child(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = child.kill() {
        debug!(pid = pid, error = %e, "Viewer process already gone");
    }
    match child.wait() {
        Ok(status) => info!(pid = pid, exit = ?status.code(), "Viewer process stopped"),
        Err(e) => warn!(pid = pid, error = %e, "Failed to wait for viewer process"),
    }
}

fn wait_for_window(
    conn: &RustConnection,
    root: Window,
    atoms: &CachedAtoms,
    window_class: &str,
    timeout: Duration,
    child: &mut Child,
) -> Result<Window> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(window) = find_window_by_class(conn, root, atoms, window_class)? {
            return Ok(window);
        }
        // A launcher may hand the deck to a running instance and exit cleanly
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                bail!("Viewer exited with {} before its window appeared", status)
            }
            Ok(_) => {}
            Err(e) => warn!(pid = child.id(), error = %e, "Failed to poll viewer process"),
        }
        if Instant::now() >= deadline {
            bail!("No window with class '{}' appeared within {:?}", window_class, timeout);
        }
        thread::sleep(Duration::from_millis(WINDOW_LOOKUP_INTERVAL_MS));
    }
}

pub struct ViewerHost<'a> {
    conn: &'a RustConnection,
    root: Window,
    atoms: CachedAtoms,
    window: Window,
    child: Option<Child>,
    injector: X11Backend<'a>,
    next_keys: Combination,
    previous_keys: Combination,
    released: ReleaseOnce,
}

impl<'a> ViewerHost<'a> {
    /// Start the viewer on `deck` and wait for its window. Not finding the window is fatal.
    pub fn launch(
        conn: &'a RustConnection,
        root: Window,
        atoms: CachedAtoms,
        settings: &ViewerSettings,
        deck: &Path,
    ) -> Result<Self> {
        let injector = X11Backend::new(conn, root)?;
        let mut child = viewer_command(&settings.command, deck)?
            .spawn()
            .with_context(|| format!("Failed to start viewer '{}'", settings.command.join(" ")))?;
        info!(pid = child.id(), deck = %deck.display(), "Started viewer");

        let window = match wait_for_window(conn, root, &atoms, &settings.window_class, settings.window_timeout, &mut child) {
            Ok(window) => window,
            Err(e) => {
                stop_child(&mut child);
                return Err(e);
            }
        };
        info!(window = window, class = %settings.window_class, "Found viewer window");

        Ok(Self {
            conn,
            root,
            atoms,
            window,
            child: Some(child),
            injector,
            next_keys: settings.next_keys.clone(),
            previous_keys: settings.previous_keys.clone(),
            released: ReleaseOnce::new(),
        })
    }

    /// Inject `keys` while the viewer holds the input focus, then give focus back.
    /// Modifiers still held from the triggering hotkey are lifted for the injection.
    fn send_keys(&mut self, keys: &Combination) -> Result<()> {
        let previous = self
            .conn
            .get_input_focus()
            .context("Failed to query input focus")?
            .reply()
            .context("Failed to get reply for input focus query")?;
        self.conn
            .set_input_focus(InputFocus::PARENT, self.window, x11rb::CURRENT_TIME)
            .context(format!("Failed to focus viewer window {}", self.window))?;

        let result = synthesize_unmodified(&mut self.injector, keys);

        self.conn
            .set_input_focus(previous.revert_to, previous.focus, x11rb::CURRENT_TIME)
            .context("Failed to restore input focus")?;
        self.conn.flush().context("Failed to flush X11 connection after key injection")?;
        result
    }
}

impl PresentationHost for ViewerHost<'_> {
    fn show(&mut self) -> Result<()> {
        restore_window(self.conn, self.root, &self.atoms, self.window)?;
        maximize_window(self.conn, self.root, &self.atoms, self.window)?;
        activate_window(self.conn, self.root, &self.atoms, self.window)
    }

    fn hide(&mut self) -> Result<()> {
        maximize_window(self.conn, self.root, &self.atoms, self.window)?;
        lower_window(self.conn, self.window)
    }

    fn next_slide(&mut self) -> Result<()> {
        let keys = self.next_keys.clone();
        self.send_keys(&keys)
    }

    fn previous_slide(&mut self) -> Result<()> {
        let keys = self.previous_keys.clone();
        self.send_keys(&keys)
    }

    fn close(&mut self) {
        if !self.released.claim() {
            return;
        }
        if let Err(e) = close_window(self.conn, &self.atoms, self.window) {
            warn!(window = self.window, error = %format!("{e:#}"), "Failed to ask viewer window to close");
        }
        if let Some(mut child) = self.child.take() {
            stop_child(&mut child);
        }
        info!(window = self.window, "Released viewer");
    }
}

impl Drop for ViewerHost<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_viewer_command_appends_deck() {
        let command = vec!["soffice".to_string(), "--nologo".to_string()];
        let cmd = viewer_command(&command, Path::new("/talks/deck.pptx")).unwrap();
        assert_eq!(cmd.get_program(), OsStr::new("soffice"));
        let args: Vec<&OsStr> = cmd.get_args().collect();
        assert_eq!(args, vec![OsStr::new("--nologo"), OsStr::new("/talks/deck.pptx")]);
    }

    #[test]
    fn test_empty_viewer_command_rejected() {
        assert!(viewer_command(&[], Path::new("deck.pptx")).is_err());
    }
}
