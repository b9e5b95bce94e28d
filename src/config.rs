//! Configuration bundle consumed at start-up
//!
//! JSON document with `general`, `text` and `presentation` sections. The key
//! names written by the legacy settings editor (`use_ppt`, `ppt`, ...) are
//! accepted as aliases, and hotkeys may be keyed by action name or numeric id.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::constants::{self, timing};
use crate::hotkeys::Action;
use crate::keys::Combination;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub text: TextSettings,
    #[serde(default, alias = "ppt")]
    pub presentation: PresentationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default, alias = "use_ppt")]
    pub use_presentation: bool,

    /// Overlay text navigation also moves the slides
    #[serde(default, alias = "simultaneous_change")]
    pub simultaneous_navigation: bool,

    /// Showing the presentation hides the overlay and vice versa
    #[serde(default, alias = "toggle_overlay_with_ppt")]
    pub toggle_together: bool,

    #[serde(default)]
    pub texts_path: Option<PathBuf>,

    /// Action name (or numeric id) → ordered key tokens
    #[serde(default = "default_hotkeys")]
    pub hotkeys: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub create_log: bool,

    #[serde(default)]
    pub log_path: Option<PathBuf>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Coordinator waits on its hotkey connection instead of polling it
    #[serde(default = "default_coordinator_blocking")]
    pub coordinator_blocking: bool,

    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextSettings {
    /// Font file path or fontconfig name; empty selects a system font
    #[serde(default)]
    pub font_path: String,

    #[serde(default = "default_font_size")]
    pub font_size: f32,

    #[serde(default = "default_color", alias = "text_color")]
    pub color: [u8; 3],

    #[serde(default)]
    pub x_pos: i32,

    #[serde(default = "default_y_pos")]
    pub y_pos: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationSettings {
    #[serde(default, alias = "ppt_path")]
    pub deck_path: Option<PathBuf>,

    /// Viewer program and arguments; the deck path is appended
    #[serde(default = "default_viewer_command")]
    pub viewer_command: Vec<String>,

    /// Case-insensitive substring of the viewer window's WM_CLASS
    #[serde(default = "default_window_class")]
    pub window_class: String,

    #[serde(default = "default_window_timeout_ms")]
    pub window_timeout_ms: u64,

    #[serde(default = "default_next_slide_keys")]
    pub next_slide_keys: Vec<String>,

    #[serde(default = "default_previous_slide_keys")]
    pub previous_slide_keys: Vec<String>,
}

fn default_hotkeys() -> BTreeMap<String, Vec<String>> {
    Action::ALL
        .iter()
        .map(|a| (a.config_key().to_string(), a.default_tokens()))
        .collect()
}

fn default_poll_interval_ms() -> u64 {
    timing::DEFAULT_POLL_INTERVAL_MS
}

fn default_coordinator_blocking() -> bool {
    true
}

fn default_join_timeout_ms() -> u64 {
    timing::DEFAULT_JOIN_TIMEOUT_MS
}

fn default_startup_timeout_ms() -> u64 {
    timing::DEFAULT_STARTUP_TIMEOUT_MS
}

fn default_font_size() -> f32 {
    20.0
}

fn default_color() -> [u8; 3] {
    [255, 255, 255]
}

fn default_y_pos() -> i32 {
    200
}

fn default_viewer_command() -> Vec<String> {
    vec!["soffice".to_string(), "--nologo".to_string(), "--norestore".to_string()]
}

fn default_window_class() -> String {
    "impress".to_string()
}

fn default_window_timeout_ms() -> u64 {
    timing::DEFAULT_WINDOW_TIMEOUT_MS
}

fn default_next_slide_keys() -> Vec<String> {
    vec!["PageDown".to_string()]
}

fn default_previous_slide_keys() -> Vec<String> {
    vec!["PageUp".to_string()]
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            use_presentation: false,
            simultaneous_navigation: false,
            toggle_together: false,
            texts_path: None,
            hotkeys: default_hotkeys(),
            create_log: false,
            log_path: None,
            poll_interval_ms: default_poll_interval_ms(),
            coordinator_blocking: default_coordinator_blocking(),
            join_timeout_ms: default_join_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }
}

impl Default for TextSettings {
    fn default() -> Self {
        Self {
            font_path: String::new(),
            font_size: default_font_size(),
            color: default_color(),
            x_pos: 0,
            y_pos: default_y_pos(),
        }
    }
}

impl Default for PresentationSettings {
    fn default() -> Self {
        Self {
            deck_path: None,
            viewer_command: default_viewer_command(),
            window_class: default_window_class(),
            window_timeout_ms: default_window_timeout_ms(),
            next_slide_keys: default_next_slide_keys(),
            previous_slide_keys: default_previous_slide_keys(),
        }
    }
}

/// The legacy editor writes "" for unset paths
fn set_path(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

/// Resolve a hotkey map key: action name or numeric id
fn parse_action_key(key: &str) -> Option<Action> {
    match key.trim().parse::<u32>() {
        Ok(id) => Action::from_id(id),
        Err(_) => Action::ALL.into_iter().find(|a| a.config_key() == key.trim()),
    }
}

/// Hotkey table after validation, restricted to the active actions
pub type Bindings = BTreeMap<Action, Combination>;

impl Config {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(constants::config::APP_DIR);
        path.push(constants::config::FILENAME);
        path
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(contents).context("Failed to parse configuration JSON")?;
        config.validate_and_clamp();
        Ok(config)
    }

    /// Load from `path`, or the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {} (try `cue-overlay default-config`)", path.display()))?;
        let config = Self::from_json(&contents).with_context(|| format!("Invalid config file {}", path.display()))?;
        info!(path = %path.display(), presentation = config.general.use_presentation, "Loaded configuration");
        Ok(config)
    }

    /// Clamp numeric values to safe ranges and drop options that need a presentation
    pub fn validate_and_clamp(&mut self) {
        use crate::constants::validation::*;

        if !self.text.font_size.is_finite() || self.text.font_size < MIN_FONT_SIZE {
            warn!(font_size = self.text.font_size, min = MIN_FONT_SIZE, "font_size below minimum, clamping");
            self.text.font_size = MIN_FONT_SIZE;
        } else if self.text.font_size > MAX_FONT_SIZE {
            warn!(font_size = self.text.font_size, max = MAX_FONT_SIZE, "font_size exceeds maximum, clamping");
            self.text.font_size = MAX_FONT_SIZE;
        }

        let poll = self
            .general
            .poll_interval_ms
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
        if poll != self.general.poll_interval_ms {
            warn!(poll_interval_ms = self.general.poll_interval_ms, using = poll, "poll_interval_ms out of range, clamping");
            self.general.poll_interval_ms = poll;
        }

        if !self.general.use_presentation && (self.general.toggle_together || self.general.simultaneous_navigation) {
            info!(
                toggle_together = self.general.toggle_together,
                simultaneous_navigation = self.general.simultaneous_navigation,
                "Presentation mode is off, ignoring presentation coupling options"
            );
            self.general.toggle_together = false;
            self.general.simultaneous_navigation = false;
        }
    }

    /// Actions that take part in this run
    pub fn active_actions(&self) -> Vec<Action> {
        Action::ALL
            .into_iter()
            .filter(|a| self.general.use_presentation || !a.requires_presentation())
            .collect()
    }

    /// Every check that must pass before anything is registered
    pub fn validate(&self) -> Result<Bindings> {
        if self.general.use_presentation {
            if set_path(&self.presentation.deck_path).is_none() {
                bail!("Presentation mode is on but no deck path is set");
            }
            if self.presentation.viewer_command.is_empty() {
                bail!("Presentation mode is on but viewer_command is empty");
            }
            self.slide_keys()?;
        } else if set_path(&self.general.texts_path).is_none() {
            bail!("Text source path not set");
        }
        if self.general.create_log && set_path(&self.general.log_path).is_none() {
            bail!("Logging is enabled but log path is not set");
        }
        self.bindings()
    }

    /// Parse the active hotkeys, rejecting missing, unparsable or duplicate bindings
    pub fn bindings(&self) -> Result<Bindings> {
        let mut declared: BTreeMap<Action, (&str, &Vec<String>)> = BTreeMap::new();
        for (key, tokens) in &self.general.hotkeys {
            let action = parse_action_key(key).ok_or_else(|| anyhow!("Unknown hotkey action '{}'", key))?;
            if let Some((first, _)) = declared.insert(action, (key.as_str(), tokens)) {
                bail!("Hotkey for '{}' is declared twice, as '{}' and '{}'", action, first, key);
            }
        }

        let mut bindings = Bindings::new();
        for action in self.active_actions() {
            let tokens = declared
                .get(&action)
                .map(|(_, tokens)| *tokens)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| anyhow!("Missing hotkey for '{}'", action))?;
            let combination = Combination::from_tokens(tokens.as_slice())
                .with_context(|| format!("Invalid hotkey for '{}'", action))?;

            if let Some((other, _)) = bindings.iter().find(|(_, c)| **c == combination) {
                bail!("Hotkeys are not unique: '{}' and '{}' both use {}", other, action, combination);
            }
            bindings.insert(action, combination);
        }
        Ok(bindings)
    }

    /// Keys sent to the viewer for next/previous slide
    pub fn slide_keys(&self) -> Result<(Combination, Combination)> {
        let next = Combination::from_tokens(self.presentation.next_slide_keys.as_slice()).context("Invalid next_slide_keys")?;
        let previous =
            Combination::from_tokens(self.presentation.previous_slide_keys.as_slice()).context("Invalid previous_slide_keys")?;
        Ok((next, previous))
    }

    pub fn texts_path(&self) -> Option<&Path> {
        set_path(&self.general.texts_path)
    }

    pub fn log_path(&self) -> Option<&Path> {
        if self.general.create_log { set_path(&self.general.log_path) } else { None }
    }

    pub fn deck_path(&self) -> Option<&Path> {
        set_path(&self.presentation.deck_path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.general.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.general.join_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.general.startup_timeout_ms)
    }

    pub fn window_timeout(&self) -> Duration {
        Duration::from_millis(self.presentation.window_timeout_ms)
    }
}

/// Read the plain-text source: one text per line, trailing whitespace removed
pub fn load_texts(path: &Path) -> Result<Vec<String>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read text source {}", path.display()))?;
    let texts = parse_texts(&contents);
    if texts.is_empty() {
        bail!("Text source {} is empty", path.display());
    }
    info!(path = %path.display(), count = texts.len(), "Loaded texts");
    Ok(texts)
}

pub fn parse_texts(contents: &str) -> Vec<String> {
    contents.lines().map(|line| line.trim_end().to_string()).collect()
}
