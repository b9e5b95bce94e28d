//! Key tokens and key combinations
//!
//! A combination is written as an ordered list of tokens (`["Ctrl", "Shift", "T"]`)
//! in the config and rendered canonically as `Ctrl + Shift + T`. Tokens resolve to
//! X11 keysyms so the same combination can be grabbed and synthesized.

use anyhow::{anyhow, bail, Result};
use std::collections::BTreeSet;
use std::fmt;

pub type Keysym = u32;

/// Modifier keys in canonical rendering order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modifier {
    Ctrl,
    Shift,
    Alt,
    Win,
}

impl Modifier {
    pub const CANONICAL_ORDER: [Modifier; 4] = [Modifier::Ctrl, Modifier::Shift, Modifier::Alt, Modifier::Win];

    pub fn name(self) -> &'static str {
        match self {
            Modifier::Ctrl => "Ctrl",
            Modifier::Shift => "Shift",
            Modifier::Alt => "Alt",
            Modifier::Win => "Win",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ctrl" | "control" => Some(Modifier::Ctrl),
            "shift" => Some(Modifier::Shift),
            "alt" => Some(Modifier::Alt),
            "win" | "super" | "meta" => Some(Modifier::Win),
            _ => None,
        }
    }

    /// Keysym of the left-hand variant, used for synthesis
    pub fn keysym(self) -> Keysym {
        match self {
            Modifier::Ctrl => 0xffe3,  // Control_L
            Modifier::Shift => 0xffe1, // Shift_L
            Modifier::Alt => 0xffe9,   // Alt_L
            Modifier::Win => 0xffeb,   // Super_L
        }
    }
}

/// Named non-character keys and their X11 keysyms
const NAMED_KEYS: &[(&str, Keysym)] = &[
    ("Tab", 0xff09),
    ("Enter", 0xff0d),
    ("Escape", 0xff1b),
    ("Space", 0x0020),
    ("Backspace", 0xff08),
    ("Delete", 0xffff),
    ("Insert", 0xff63),
    ("Home", 0xff50),
    ("End", 0xff57),
    ("PageUp", 0xff55),
    ("PageDown", 0xff56),
    ("Left", 0xff51),
    ("Up", 0xff52),
    ("Right", 0xff53),
    ("Down", 0xff54),
];

/// One element of a combination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyToken {
    Modifier(Modifier),
    Key { name: String, keysym: Keysym },
}

impl KeyToken {
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            bail!("Empty key token");
        }
        if let Some(modifier) = Modifier::from_name(token) {
            return Ok(KeyToken::Modifier(modifier));
        }

        let mut chars = token.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if c.is_ascii_alphanumeric() {
                let upper = c.to_ascii_uppercase();
                // Letters resolve to their lowercase keysym (first column of the keymap)
                let keysym = c.to_ascii_lowercase() as Keysym;
                return Ok(KeyToken::Key { name: upper.to_string(), keysym });
            }
        }

        if let Some(number) = token
            .strip_prefix('F')
            .or_else(|| token.strip_prefix('f'))
            .and_then(|n| n.parse::<u32>().ok())
            && (1..=12).contains(&number)
        {
            return Ok(KeyToken::Key { name: format!("F{number}"), keysym: 0xffbe + number - 1 });
        }

        NAMED_KEYS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
            .map(|(name, keysym)| KeyToken::Key { name: name.to_string(), keysym: *keysym })
            .ok_or_else(|| anyhow!("Unknown key token '{}'", token))
    }

    pub fn name(&self) -> &str {
        match self {
            KeyToken::Modifier(m) => m.name(),
            KeyToken::Key { name, .. } => name,
        }
    }

    pub fn keysym(&self) -> Keysym {
        match self {
            KeyToken::Modifier(m) => m.keysym(),
            KeyToken::Key { keysym, .. } => *keysym,
        }
    }

    pub fn is_modifier(&self) -> bool {
        matches!(self, KeyToken::Modifier(_))
    }
}

/// A set of simultaneously held keys, kept in declared order for synthesis
#[derive(Debug, Clone)]
pub struct Combination {
    tokens: Vec<KeyToken>,
}

impl Combination {
    /// Build from config tokens; exactly one non-modifier key is required
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let mut parsed: Vec<KeyToken> = Vec::with_capacity(tokens.len());
        for token in tokens {
            let token = KeyToken::parse(token.as_ref())?;
            if !parsed.contains(&token) {
                parsed.push(token);
            }
        }

        let keys = parsed.iter().filter(|t| !t.is_modifier()).count();
        match keys {
            0 => bail!("Combination has no non-modifier key"),
            1 => Ok(Self { tokens: parsed }),
            _ => bail!("Combination has {} non-modifier keys, expected one", keys),
        }
    }

    /// Parse the rendered form (`Ctrl + Shift + K`)
    pub fn parse(text: &str) -> Result<Self> {
        let tokens: Vec<&str> = text.split('+').map(str::trim).collect();
        Self::from_tokens(&tokens)
    }

    pub fn tokens(&self) -> &[KeyToken] {
        &self.tokens
    }

    pub fn modifiers(&self) -> BTreeSet<Modifier> {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                KeyToken::Modifier(m) => Some(*m),
                KeyToken::Key { .. } => None,
            })
            .collect()
    }

    /// The single non-modifier key
    pub fn key(&self) -> &KeyToken {
        self.tokens
            .iter()
            .find(|t| !t.is_modifier())
            .unwrap_or(&self.tokens[0])
    }

    /// Canonical token list: modifiers in fixed order, then the key
    pub fn canonical_tokens(&self) -> Vec<String> {
        let modifiers = self.modifiers();
        Modifier::CANONICAL_ORDER
            .iter()
            .filter(|m| modifiers.contains(m))
            .map(|m| m.name().to_string())
            .chain(std::iter::once(self.key().name().to_string()))
            .collect()
    }
}

/// Two combinations are equal when they hold the same keys, whatever the declared order
impl PartialEq for Combination {
    fn eq(&self, other: &Self) -> bool {
        self.modifiers() == other.modifiers() && self.key() == other.key()
    }
}

impl Eq for Combination {}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_tokens().join(" + "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_letter_and_modifiers() {
        let combo = Combination::from_tokens(&["Ctrl", "Shift", "t"]).unwrap();
        assert_eq!(combo.to_string(), "Ctrl + Shift + T");
        assert_eq!(combo.key().keysym(), 't' as u32);
        assert!(combo.modifiers().contains(&Modifier::Ctrl));
    }

    #[test]
    fn test_canonical_order_ignores_declared_order() {
        let a = Combination::from_tokens(&["Alt", "Shift", "Ctrl", "K"]).unwrap();
        let b = Combination::parse("Ctrl + Shift + Alt + K").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "Ctrl + Shift + Alt + K");
        // Declared order survives for synthesis
        assert_eq!(a.tokens()[0], KeyToken::Modifier(Modifier::Alt));
    }

    #[test]
    fn test_named_and_function_keys() {
        assert_eq!(KeyToken::parse("pagedown").unwrap().keysym(), 0xff56);
        assert_eq!(KeyToken::parse("F1").unwrap().keysym(), 0xffbe);
        assert_eq!(KeyToken::parse("F12").unwrap().keysym(), 0xffc9);
        assert_eq!(KeyToken::parse("7").unwrap().keysym(), '7' as u32);
        assert!(KeyToken::parse("F13").is_err());
        assert!(KeyToken::parse("Hyper").is_err());
    }

    #[test]
    fn test_rejects_modifier_only_and_multi_key() {
        assert!(Combination::from_tokens(&["Ctrl", "Shift"]).is_err());
        assert!(Combination::from_tokens(&["Ctrl", "A", "B"]).is_err());
        let empty: [&str; 0] = [];
        assert!(Combination::from_tokens(&empty).is_err());
    }

    #[test]
    fn test_different_modifiers_not_equal() {
        let a = Combination::parse("Ctrl + Shift + T").unwrap();
        let b = Combination::parse("Ctrl + T").unwrap();
        assert_ne!(a, b);
    }
}
