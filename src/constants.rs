//! Application-wide constants
//!
//! Magic numbers and string literals used across the actors, kept in one
//! place so the X11, evdev and timing code agree on them.

/// X11 protocol and rendering constants
pub mod x11 {
    /// ARGB color depth (32-bit: 8 bits each for Alpha, Red, Green, Blue)
    pub const ARGB_DEPTH: u8 = 32;

    /// Bytes per pixel for ARGB32 images uploaded via PutImage
    pub const ARGB_BYTES_PER_PIXEL: usize = 4;

    /// Override redirect flag for unmanaged windows
    pub const OVERRIDE_REDIRECT: u32 = 1;

    /// Source indication for _NET_ACTIVE_WINDOW (2 = pager/direct user action)
    pub const ACTIVE_WINDOW_SOURCE_PAGER: u32 = 2;

    /// _NET_WM_STATE client message actions
    pub const NET_WM_STATE_REMOVE: u32 = 0;
    pub const NET_WM_STATE_ADD: u32 = 1;

    /// WM_CLASS value of the overlay surface (instance\0class\0)
    pub const OVERLAY_WM_CLASS: &[u8] = b"cue-overlay\0cue-overlay\0";

    /// Header overhead reserved when chunking PutImage requests
    pub const PUT_IMAGE_HEADER_BYTES: usize = 64;
}

/// Input event constants (from evdev)
pub mod input {
    /// Key press event value
    pub const KEY_PRESS: i32 = 1;

    /// Key release event value
    pub const KEY_RELEASE: i32 = 0;

    /// Sleep between reads while a capture device has nothing queued
    pub const CAPTURE_POLL_INTERVAL_MS: u64 = 10;

    /// Upper bound on waiting for a capture listener to exit
    pub const CAPTURE_JOIN_TIMEOUT_MS: u64 = 1_000;
}

/// Filesystem paths
pub mod paths {
    /// Directory holding evdev device nodes
    pub const DEV_INPUT: &str = "/dev/input";
}

/// Permission hints shown when evdev access fails
pub mod permissions {
    /// Group that grants read access to /dev/input
    pub const INPUT_GROUP: &str = "input";

    /// Command that adds the current user to the input group
    pub const ADD_TO_INPUT_GROUP: &str = "sudo usermod -aG input $USER";
}

/// Configuration file location
pub mod config {
    /// Directory under the XDG config dir
    pub const APP_DIR: &str = "cue-overlay";

    /// Settings bundle filename
    pub const FILENAME: &str = "settings.json";
}

/// Loop and shutdown timing defaults (milliseconds)
pub mod timing {
    /// Actor loop sleep when no event is pending
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

    /// Bounded wait for each actor thread during shutdown
    pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 5_000;

    /// Bounded wait for an actor's start-up handshake
    pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;

    /// How long to look for the viewer's top-level window
    pub const DEFAULT_WINDOW_TIMEOUT_MS: u64 = 20_000;

    /// Delay between two viewer window lookups
    pub const WINDOW_LOOKUP_INTERVAL_MS: u64 = 250;
}

/// Text compositor layout constants
pub mod compositor {
    /// Appended while measuring so ascender/descender extents are always included
    pub const REFERENCE_SUFFIX: &str = "Ag";

    /// Text top = surface height - factor * measured height
    pub const BASELINE_FACTOR: f32 = 1.5;
}

/// Timing log line format
pub mod timing_log {
    /// Prefix of the elapsed-only line
    pub const ELAPSED_PREFIX: char = '\u{2014}';
}

/// Slide deck parts and naming
pub mod deck {
    /// Placeholder for slides without any text (followed by the 1-based slide number)
    pub const UNTITLED_PREFIX: &str = "Untitled Slide";

    pub const PRESENTATION_PART: &str = "ppt/presentation.xml";
    pub const PRESENTATION_RELS_PART: &str = "ppt/_rels/presentation.xml.rels";

    /// Relationship targets are relative to this folder
    pub const PART_ROOT: &str = "ppt/";
}

/// Validation limits for config values
pub mod validation {
    pub const MIN_FONT_SIZE: f32 = 1.0;
    pub const MAX_FONT_SIZE: f32 = 400.0;
    pub const MIN_POLL_INTERVAL_MS: u64 = 1;
    pub const MAX_POLL_INTERVAL_MS: u64 = 1_000;
}
