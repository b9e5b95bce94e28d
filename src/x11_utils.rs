use anyhow::{Context, Result};
use tracing::debug;
use x11rb::connection::Connection;
use x11rb::protocol::render::{ConnectionExt as RenderExt, Pictformat};
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;

use crate::constants::x11;

/// Pre-cached X11 atoms to avoid repeated roundtrips
#[derive(Debug, Clone, Copy)]
pub struct CachedAtoms {
    pub wm_class: Atom,
    pub net_wm_state: Atom,
    pub net_wm_state_above: Atom,
    pub net_wm_state_hidden: Atom,
    pub net_wm_state_maximized_vert: Atom,
    pub net_wm_state_maximized_horz: Atom,
    pub net_active_window: Atom,
    pub net_client_list: Atom,
    pub wm_protocols: Atom,
    pub wm_delete_window: Atom,
    /// Private message type used to wake the coordinator's blocking wait
    pub wake: Atom,
}

fn intern(conn: &RustConnection, name: &str) -> Result<Atom> {
    Ok(conn
        .intern_atom(false, name.as_bytes())
        .context(format!("Failed to intern {} atom", name))?
        .reply()
        .context(format!("Failed to get reply for {} atom", name))?
        .atom)
}

impl CachedAtoms {
    pub fn new(conn: &RustConnection) -> Result<Self> {
        Ok(Self {
            wm_class: AtomEnum::WM_CLASS.into(),
            net_wm_state: intern(conn, "_NET_WM_STATE")?,
            net_wm_state_above: intern(conn, "_NET_WM_STATE_ABOVE")?,
            net_wm_state_hidden: intern(conn, "_NET_WM_STATE_HIDDEN")?,
            net_wm_state_maximized_vert: intern(conn, "_NET_WM_STATE_MAXIMIZED_VERT")?,
            net_wm_state_maximized_horz: intern(conn, "_NET_WM_STATE_MAXIMIZED_HORZ")?,
            net_active_window: intern(conn, "_NET_ACTIVE_WINDOW")?,
            net_client_list: intern(conn, "_NET_CLIENT_LIST")?,
            wm_protocols: intern(conn, "WM_PROTOCOLS")?,
            wm_delete_window: intern(conn, "WM_DELETE_WINDOW")?,
            wake: intern(conn, "_CUE_OVERLAY_WAKE")?,
        })
    }
}

#[tracing::instrument(skip(conn))]
pub fn get_pictformat(conn: &RustConnection, depth: u8, alpha: bool) -> Result<Pictformat> {
    let formats = conn
        .render_query_pict_formats()
        .context("Failed to query RENDER picture formats")?
        .reply()
        .context("Failed to get reply for RENDER picture formats query")?
        .formats;

    let format = formats.iter().find(|format| {
        format.depth == depth
            && if alpha {
                format.direct.alpha_mask != 0
            } else {
                format.direct.alpha_mask == 0
            }
    });

    match format {
        Some(format) => {
            debug!(depth = format.depth, alpha_mask = format.direct.alpha_mask, "Using Pictformat");
            Ok(format.id)
        }
        None => anyhow::bail!(
            "Could not find suitable picture format (depth={}, alpha={}). Check RENDER extension support.",
            depth,
            alpha
        ),
    }
}

/// Find a 32-bit TrueColor visual for per-pixel transparency
pub fn find_argb_visual(screen: &Screen) -> Option<Visualid> {
    screen
        .allowed_depths
        .iter()
        .filter(|d| d.depth == x11::ARGB_DEPTH)
        .flat_map(|d| d.visuals.iter())
        .find(|v| v.class == VisualClass::TRUE_COLOR)
        .map(|v| v.visual_id)
}

fn send_root_message(conn: &RustConnection, root: Window, window: Window, type_: Atom, data: [u32; 5]) -> Result<()> {
    let event = ClientMessageEvent {
        response_type: CLIENT_MESSAGE_EVENT,
        format: 32,
        sequence: 0,
        window,
        type_,
        data: ClientMessageData::from(data),
    };
    conn.send_event(
        false,
        root,
        EventMask::SUBSTRUCTURE_NOTIFY | EventMask::SUBSTRUCTURE_REDIRECT,
        event,
    )
    .context(format!("Failed to send client message to root for window {}", window))?;
    Ok(())
}

/// Add or remove up to two `_NET_WM_STATE` properties on a managed window
pub fn change_wm_state(
    conn: &RustConnection,
    root: Window,
    atoms: &CachedAtoms,
    window: Window,
    add: bool,
    first: Atom,
    second: Atom,
) -> Result<()> {
    let action = if add { x11::NET_WM_STATE_ADD } else { x11::NET_WM_STATE_REMOVE };
    send_root_message(
        conn,
        root,
        window,
        atoms.net_wm_state,
        [action, first, second, x11::ACTIVE_WINDOW_SOURCE_PAGER, 0],
    )
}

/// Activate (focus) an X11 window using _NET_ACTIVE_WINDOW
pub fn activate_window(conn: &RustConnection, root: Window, atoms: &CachedAtoms, window: Window) -> Result<()> {
    conn.configure_window(window, &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE))
        .context(format!("Failed to raise window {} to top of stack", window))?;

    send_root_message(
        conn,
        root,
        window,
        atoms.net_active_window,
        [x11::ACTIVE_WINDOW_SOURCE_PAGER, x11rb::CURRENT_TIME, 0, 0, 0],
    )?;

    conn.flush().context("Failed to flush X11 connection after window activation")?;
    Ok(())
}

pub fn maximize_window(conn: &RustConnection, root: Window, atoms: &CachedAtoms, window: Window) -> Result<()> {
    change_wm_state(
        conn,
        root,
        atoms,
        window,
        true,
        atoms.net_wm_state_maximized_vert,
        atoms.net_wm_state_maximized_horz,
    )
    .context(format!("Failed to maximize window {}", window))
}

/// Map and un-minimize a window
pub fn restore_window(conn: &RustConnection, root: Window, atoms: &CachedAtoms, window: Window) -> Result<()> {
    conn.map_window(window).context(format!("Failed to map window {}", window))?;
    change_wm_state(conn, root, atoms, window, false, atoms.net_wm_state_hidden, 0)
        .context(format!("Failed to restore window {}", window))
}

/// Send a window to the bottom of the stack without activating anything
pub fn lower_window(conn: &RustConnection, window: Window) -> Result<()> {
    conn.configure_window(window, &ConfigureWindowAux::new().stack_mode(StackMode::BELOW))
        .context(format!("Failed to lower window {}", window))?;
    conn.flush().context("Failed to flush X11 connection after lowering window")?;
    Ok(())
}

/// Whether a raw WM_CLASS value (`instance\0class\0`) contains `needle`, case-insensitively
pub fn wm_class_matches(raw: &[u8], needle: &str) -> bool {
    let needle = needle.to_ascii_lowercase();
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .any(|part| String::from_utf8_lossy(part).to_ascii_lowercase().contains(&needle))
}

/// First managed top-level window whose WM_CLASS contains `needle`
pub fn find_window_by_class(
    conn: &RustConnection,
    root: Window,
    atoms: &CachedAtoms,
    needle: &str,
) -> Result<Option<Window>> {
    let clients = conn
        .get_property(false, root, atoms.net_client_list, AtomEnum::WINDOW, 0, u32::MAX)
        .context("Failed to query _NET_CLIENT_LIST")?
        .reply()
        .context("Failed to get reply for _NET_CLIENT_LIST")?;
    let Some(windows) = clients.value32() else {
        return Ok(None);
    };

    for window in windows {
        let class = conn
            .get_property(false, window, atoms.wm_class, AtomEnum::STRING, 0, 1024)
            .context(format!("Failed to query WM_CLASS for window {}", window))?
            .reply();
        // Windows can disappear between the list and the query
        let Ok(class) = class else {
            continue;
        };
        if wm_class_matches(&class.value, needle) {
            debug!(window = window, class = %String::from_utf8_lossy(&class.value), "Matched window class");
            return Ok(Some(window));
        }
    }
    Ok(None)
}

/// Ask a client to close `window` through WM_DELETE_WINDOW
pub fn close_window(conn: &RustConnection, atoms: &CachedAtoms, window: Window) -> Result<()> {
    let event = ClientMessageEvent {
        response_type: CLIENT_MESSAGE_EVENT,
        format: 32,
        sequence: 0,
        window,
        type_: atoms.wm_protocols,
        data: ClientMessageData::from([atoms.wm_delete_window, x11rb::CURRENT_TIME, 0, 0, 0]),
    };
    conn.send_event(false, window, EventMask::NO_EVENT, event)
        .context(format!("Failed to send WM_DELETE_WINDOW to window {}", window))?;
    conn.flush().context("Failed to flush X11 connection after close request")?;
    Ok(())
}

/// Wake a connection blocked in `wait_for_event` by messaging its window
pub fn send_wake(conn: &RustConnection, atoms: &CachedAtoms, window: Window) -> Result<()> {
    let event = ClientMessageEvent {
        response_type: CLIENT_MESSAGE_EVENT,
        format: 32,
        sequence: 0,
        window,
        type_: atoms.wake,
        data: ClientMessageData::from([0u32; 5]),
    };
    conn.send_event(false, window, EventMask::NO_EVENT, event)
        .context(format!("Failed to send wake message to window {}", window))?;
    conn.flush().context("Failed to flush X11 connection after wake message")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wm_class_matches() {
        assert!(wm_class_matches(b"libreoffice\0libreoffice-impress\0", "impress"));
        assert!(wm_class_matches(b"soffice\0Soffice\0", "SOFFICE"));
        assert!(!wm_class_matches(b"firefox\0Firefox\0", "impress"));
        assert!(!wm_class_matches(b"", "impress"));
    }
}
