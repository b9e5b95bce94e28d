//! X11 hotkey backend: passive key grabs on the root window and XTEST injection

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use tracing::debug;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::*;
use x11rb::protocol::xtest::ConnectionExt as XTestExt;
use x11rb::rust_connection::RustConnection;

use super::{HotkeyBackend, HotkeyId, HotkeySignal, RawKeycode};
use crate::keys::{Combination, KeyToken, Keysym, Modifier};

/// Lock-style modifiers that must not change whether a hotkey matches
fn ignored_variants() -> [u16; 4] {
    let lock = u16::from(ModMask::LOCK);
    let num_lock = u16::from(ModMask::M2);
    [0, lock, num_lock, lock | num_lock]
}

fn modifier_mask(modifier: Modifier) -> u16 {
    match modifier {
        Modifier::Ctrl => u16::from(ModMask::CONTROL),
        Modifier::Shift => u16::from(ModMask::SHIFT),
        Modifier::Alt => u16::from(ModMask::M1),
        Modifier::Win => u16::from(ModMask::M4),
    }
}

/// Rows of the modifier mapping that hotkeys use: Shift, Control, Mod1, Mod4
const HOTKEY_MODIFIER_ROWS: [usize; 4] = [0, 2, 3, 6];

fn relevant_mask() -> u16 {
    Modifier::CANONICAL_ORDER.iter().map(|m| modifier_mask(*m)).fold(0, |acc, m| acc | m)
}

/// Keycode → keysym table fetched once per connection
#[derive(Debug)]
struct Keymap {
    min_keycode: u8,
    per_keycode: usize,
    keysyms: Vec<Keysym>,
}

impl Keymap {
    fn load(conn: &RustConnection) -> Result<Self> {
        let setup = conn.setup();
        let min_keycode = setup.min_keycode;
        let count = setup.max_keycode - min_keycode + 1;
        let reply = conn
            .get_keyboard_mapping(min_keycode, count)
            .context("Failed to query keyboard mapping")?
            .reply()
            .context("Failed to get keyboard mapping reply")?;
        Ok(Self {
            min_keycode,
            per_keycode: reply.keysyms_per_keycode as usize,
            keysyms: reply.keysyms,
        })
    }

    fn keycode_for(&self, keysym: Keysym) -> Option<Keycode> {
        if self.per_keycode == 0 {
            return None;
        }
        self.keysyms
            .chunks(self.per_keycode)
            .position(|syms| syms.contains(&keysym))
            .map(|index| self.min_keycode + index as u8)
    }
}

pub struct X11Backend<'a> {
    conn: &'a RustConnection,
    root: Window,
    keymap: Keymap,
    grabs: HashMap<(Keycode, u16), HotkeyId>,
}

impl<'a> X11Backend<'a> {
    pub fn new(conn: &'a RustConnection, root: Window) -> Result<Self> {
        Ok(Self {
            conn,
            root,
            keymap: Keymap::load(conn)?,
            grabs: HashMap::new(),
        })
    }

    fn resolve(&self, combination: &Combination) -> Result<(Keycode, u16)> {
        let key = combination.key();
        let keycode = self
            .keymap
            .keycode_for(key.keysym())
            .ok_or_else(|| anyhow!("Key '{}' is not on the current keyboard map", key.name()))?;
        let mods = combination
            .modifiers()
            .into_iter()
            .map(modifier_mask)
            .fold(0, |acc, m| acc | m);
        Ok((keycode, mods))
    }

    /// Resolve a KeyPress delivered to this connection into a hotkey signal
    pub fn signal_for(&self, event: &KeyPressEvent) -> Option<HotkeySignal> {
        let clean = u16::from(event.state) & relevant_mask();
        self.grabs
            .get(&(event.detail, clean))
            .map(|id| HotkeySignal { id: *id })
    }

    fn release_variants(&self, keycode: Keycode, mods: u16, variants: &[u16]) {
        for variant in variants {
            if let Err(e) = self.conn.ungrab_key(keycode, self.root, ModMask::from(mods | variant)) {
                debug!(keycode = keycode, error = %e, "Failed to release partial key grab");
            }
        }
    }
}

impl HotkeyBackend for X11Backend<'_> {
    fn grab(&mut self, id: HotkeyId, combination: &Combination) -> Result<()> {
        let (keycode, mods) = self.resolve(combination)?;
        if let Some(existing) = self.grabs.get(&(keycode, mods)) {
            anyhow::bail!("Combination {} already bound to hotkey id {}", combination, existing);
        }

        let variants = ignored_variants();
        for (done, variant) in variants.iter().enumerate() {
            let result = self
                .conn
                .grab_key(
                    true,
                    self.root,
                    ModMask::from(mods | variant),
                    keycode,
                    GrabMode::ASYNC,
                    GrabMode::ASYNC,
                )
                .context("Failed to send GrabKey request")?
                .check();
            if let Err(e) = result {
                self.release_variants(keycode, mods, &variants[..done]);
                return Err(anyhow!(e))
                    .context(format!("X server rejected grab for {} (taken by another client?)", combination));
            }
        }

        self.grabs.insert((keycode, mods), id);
        Ok(())
    }

    fn ungrab(&mut self, id: HotkeyId, combination: &Combination) -> Result<()> {
        let (keycode, mods) = self.resolve(combination)?;
        if self.grabs.get(&(keycode, mods)) != Some(&id) {
            return Ok(());
        }
        for variant in ignored_variants() {
            self.conn
                .ungrab_key(keycode, self.root, ModMask::from(mods | variant))
                .context(format!("Failed to ungrab {}", combination))?;
        }
        self.grabs.remove(&(keycode, mods));
        Ok(())
    }

    fn inject(&mut self, key: &KeyToken, pressed: bool) -> Result<()> {
        let keycode = self
            .keymap
            .keycode_for(key.keysym())
            .ok_or_else(|| anyhow!("Cannot synthesize '{}': no keycode on the current keyboard map", key.name()))?;
        self.inject_raw(keycode, pressed)
            .context(format!("Failed to inject '{}'", key.name()))
    }

    fn inject_raw(&mut self, keycode: RawKeycode, pressed: bool) -> Result<()> {
        let kind = if pressed { KEY_PRESS_EVENT } else { KEY_RELEASE_EVENT };
        self.conn
            .xtest_fake_input(kind, keycode, x11rb::CURRENT_TIME, self.root, 0, 0, 0)
            .context(format!("Failed to inject keycode {} via XTEST", keycode))?;
        Ok(())
    }

    fn held_modifiers(&mut self) -> Result<Vec<RawKeycode>> {
        let pressed = self
            .conn
            .query_keymap()
            .context("Failed to query keymap state")?
            .reply()
            .context("Failed to get keymap state reply")?
            .keys;
        let mapping = self
            .conn
            .get_modifier_mapping()
            .context("Failed to query modifier mapping")?
            .reply()
            .context("Failed to get modifier mapping reply")?;

        let per_modifier = mapping.keycodes.len() / 8;
        if per_modifier == 0 {
            return Ok(Vec::new());
        }
        let mut held = Vec::new();
        for (row, keycodes) in mapping.keycodes.chunks(per_modifier).enumerate() {
            if !HOTKEY_MODIFIER_ROWS.contains(&row) {
                continue;
            }
            for &keycode in keycodes {
                let down = pressed[usize::from(keycode / 8)] & (1 << (keycode % 8)) != 0;
                if keycode != 0 && down && !held.contains(&keycode) {
                    held.push(keycode);
                }
            }
        }
        Ok(held)
    }

    fn flush(&mut self) -> Result<()> {
        self.conn.flush().context("Failed to flush X11 connection")?;
        Ok(())
    }
}
