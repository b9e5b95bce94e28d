//! Global hotkey routing
//!
//! Each actor owns one `HotkeyRouter` over its own backend connection. The router
//! maps logical actions to process-wide numeric ids, keeps the grab table, and
//! turns incoming hotkey signals back into actions.

pub mod capture;
pub mod x11;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::keys::{Combination, KeyToken};

/// Process-wide numeric hotkey identifier
pub type HotkeyId = u32;

/// Hardware key code as the backend sees it
pub type RawKeycode = u8;

/// The ten logical actions that can be bound to a combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Show,
    Hide,
    NextText,
    PreviousText,
    ShowPresentation,
    HidePresentation,
    NextSlide,
    PreviousSlide,
    StartTimer,
    Quit,
}

/// Which loop registers (and reacts to) an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Overlay,
    Presentation,
    Coordinator,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::Show,
        Action::Hide,
        Action::NextText,
        Action::PreviousText,
        Action::ShowPresentation,
        Action::HidePresentation,
        Action::NextSlide,
        Action::PreviousSlide,
        Action::StartTimer,
        Action::Quit,
    ];

    pub fn id(self) -> HotkeyId {
        match self {
            Action::Show => 1,
            Action::Hide => 2,
            Action::NextText => 3,
            Action::PreviousText => 4,
            Action::ShowPresentation => 5,
            Action::HidePresentation => 6,
            Action::NextSlide => 7,
            Action::PreviousSlide => 8,
            Action::StartTimer => 9,
            Action::Quit => 10,
        }
    }

    pub fn from_id(id: HotkeyId) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.id() == id)
    }

    pub fn owner(self) -> Owner {
        match self {
            Action::Show | Action::Hide | Action::NextText | Action::PreviousText | Action::StartTimer => {
                Owner::Overlay
            }
            Action::ShowPresentation
            | Action::HidePresentation
            | Action::NextSlide
            | Action::PreviousSlide => Owner::Presentation,
            Action::Quit => Owner::Coordinator,
        }
    }

    pub fn requires_presentation(self) -> bool {
        self.owner() == Owner::Presentation
    }

    pub fn config_key(self) -> &'static str {
        match self {
            Action::Show => "show",
            Action::Hide => "hide",
            Action::NextText => "next-text",
            Action::PreviousText => "previous-text",
            Action::ShowPresentation => "show-presentation",
            Action::HidePresentation => "hide-presentation",
            Action::NextSlide => "next-slide",
            Action::PreviousSlide => "previous-slide",
            Action::StartTimer => "start-timer",
            Action::Quit => "quit",
        }
    }

    /// Default binding tokens
    pub fn default_tokens(self) -> Vec<String> {
        let key = match self {
            Action::Show => "W",
            Action::Hide => "Q",
            Action::NextText => "T",
            Action::PreviousText => "R",
            Action::ShowPresentation => "G",
            Action::HidePresentation => "A",
            Action::NextSlide => "F",
            Action::PreviousSlide => "D",
            Action::StartTimer => "S",
            Action::Quit => "X",
        };
        vec!["Ctrl".to_string(), "Shift".to_string(), key.to_string()]
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_key())
    }
}

/// OS-facing half of the router: grabs combinations and injects synthetic keys
pub trait HotkeyBackend {
    /// Register a combination under `id`; an error means the binding was rejected
    fn grab(&mut self, id: HotkeyId, combination: &Combination) -> Result<()>;

    /// Release a combination previously grabbed under `id`
    fn ungrab(&mut self, id: HotkeyId, combination: &Combination) -> Result<()>;

    /// Inject one synthetic key transition
    fn inject(&mut self, key: &KeyToken, pressed: bool) -> Result<()>;

    /// Inject a transition for a raw key code
    fn inject_raw(&mut self, keycode: RawKeycode, pressed: bool) -> Result<()>;

    /// Modifier keys currently down on the keyboard, by key code
    fn held_modifiers(&mut self) -> Result<Vec<RawKeycode>>;

    /// Push queued requests to the server
    fn flush(&mut self) -> Result<()>;
}

/// A matched-combination event delivered by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotkeySignal {
    pub id: HotkeyId,
}

#[derive(Debug)]
struct Binding {
    combination: Combination,
    registered: bool,
}

pub struct HotkeyRouter<B: HotkeyBackend> {
    backend: B,
    bindings: BTreeMap<Action, Binding>,
    owner_label: &'static str,
}

impl<B: HotkeyBackend> HotkeyRouter<B> {
    pub fn new(backend: B, owner_label: &'static str) -> Self {
        Self {
            backend,
            bindings: BTreeMap::new(),
            owner_label,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Register `combination` for `action`. Failure is logged and reported, never fatal.
    pub fn register(&mut self, action: Action, combination: Combination) -> bool {
        if self.bindings.get(&action).is_some_and(|b| b.registered) {
            self.unregister(action);
        }

        let registered = match self.backend.grab(action.id(), &combination) {
            Ok(()) => {
                info!(owner = self.owner_label, action = %action, id = action.id(), combination = %combination, "Registered hotkey");
                true
            }
            Err(e) => {
                error!(owner = self.owner_label, action = %action, combination = %combination, error = %e, "Failed to register hotkey");
                false
            }
        };
        if let Err(e) = self.backend.flush() {
            warn!(owner = self.owner_label, error = %e, "Failed to flush after hotkey registration");
        }

        self.bindings.insert(action, Binding { combination, registered });
        registered
    }

    /// Best-effort release. Safe to call for actions that never registered.
    pub fn unregister(&mut self, action: Action) {
        let Some(binding) = self.bindings.remove(&action) else {
            debug!(owner = self.owner_label, action = %action, "Hotkey not bound, nothing to unregister");
            return;
        };
        if !binding.registered {
            debug!(owner = self.owner_label, action = %action, "Hotkey never registered, skipping release");
            return;
        }
        match self.backend.ungrab(action.id(), &binding.combination) {
            Ok(()) => info!(owner = self.owner_label, action = %action, "Unregistered hotkey"),
            Err(e) => warn!(owner = self.owner_label, action = %action, error = %e, "Failed to unregister hotkey"),
        }
    }

    pub fn unregister_all(&mut self) {
        let actions: Vec<Action> = self.bindings.keys().copied().collect();
        for action in actions {
            self.unregister(action);
        }
        if let Err(e) = self.backend.flush() {
            warn!(owner = self.owner_label, error = %e, "Failed to flush after releasing hotkeys");
        }
    }

    pub fn is_registered(&self, action: Action) -> bool {
        self.bindings.get(&action).is_some_and(|b| b.registered)
    }

    /// Look up the signalled id and hand the bound action to `handler`.
    /// Returns false for ids this router does not own.
    pub fn dispatch<F: FnOnce(Action)>(&self, signal: HotkeySignal, handler: F) -> bool {
        match Action::from_id(signal.id) {
            Some(action) if self.is_registered(action) => {
                debug!(owner = self.owner_label, action = %action, "Dispatching hotkey");
                handler(action);
                true
            }
            _ => {
                debug!(owner = self.owner_label, id = signal.id, "Ignoring unrecognized hotkey id");
                false
            }
        }
    }

    /// Inject `combination` as synthetic input
    pub fn synthesize(&mut self, combination: &Combination) -> Result<()> {
        synthesize(&mut self.backend, combination)
    }
}

/// Press the tokens in declared order, then release them in reverse order
pub fn synthesize<B: HotkeyBackend + ?Sized>(backend: &mut B, combination: &Combination) -> Result<()> {
    for token in combination.tokens() {
        backend.inject(token, true)?;
    }
    for token in combination.tokens().iter().rev() {
        backend.inject(token, false)?;
    }
    backend.flush()?;
    debug!(combination = %combination, "Synthesized key combination");
    Ok(())
}

/// Synthesize `combination` with any physically held modifiers lifted.
///
/// A hotkey fires while its own modifiers are still down; without lifting them
/// the target would see e.g. `Ctrl + Shift + PageDown`. The held keys are
/// pressed again afterwards so the server state matches the keyboard.
pub fn synthesize_unmodified<B: HotkeyBackend + ?Sized>(backend: &mut B, combination: &Combination) -> Result<()> {
    let held = backend.held_modifiers()?;
    if !held.is_empty() {
        debug!(keycodes = ?held, "Lifting held modifiers before injection");
    }
    for keycode in &held {
        backend.inject_raw(*keycode, false)?;
    }
    let result = synthesize(backend, combination);
    for keycode in &held {
        backend.inject_raw(*keycode, true)?;
    }
    backend.flush()?;
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::bail;

    /// In-memory backend recording every call
    #[derive(Debug, Default)]
    pub(crate) struct FakeBackend {
        pub grabbed: Vec<HotkeyId>,
        pub ungrabbed: Vec<HotkeyId>,
        pub injected: Vec<(String, bool)>,
        pub reject: Vec<HotkeyId>,
        pub held: Vec<RawKeycode>,
    }

    impl HotkeyBackend for FakeBackend {
        fn grab(&mut self, id: HotkeyId, _combination: &Combination) -> Result<()> {
            if self.reject.contains(&id) {
                bail!("BadAccess: combination already grabbed");
            }
            self.grabbed.push(id);
            Ok(())
        }

        fn ungrab(&mut self, id: HotkeyId, _combination: &Combination) -> Result<()> {
            self.ungrabbed.push(id);
            Ok(())
        }

        fn inject(&mut self, key: &KeyToken, pressed: bool) -> Result<()> {
            self.injected.push((key.name().to_string(), pressed));
            Ok(())
        }

        fn inject_raw(&mut self, keycode: RawKeycode, pressed: bool) -> Result<()> {
            self.injected.push((format!("#{keycode}"), pressed));
            Ok(())
        }

        fn held_modifiers(&mut self) -> Result<Vec<RawKeycode>> {
            Ok(self.held.clone())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn combo(text: &str) -> Combination {
        Combination::parse(text).unwrap()
    }

    #[test]
    fn test_action_ids_are_unique_and_round_trip() {
        for action in Action::ALL {
            assert_eq!(Action::from_id(action.id()), Some(action));
        }
        let mut ids: Vec<_> = Action::ALL.iter().map(|a| a.id()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 10);
        assert_eq!(Action::ALL.iter().filter(|a| !a.requires_presentation()).count(), 6);
    }

    #[test]
    fn test_register_and_dispatch() {
        let mut router = HotkeyRouter::new(FakeBackend::default(), "test");
        assert!(router.register(Action::NextText, combo("Ctrl + Shift + T")));

        let mut seen = None;
        assert!(router.dispatch(HotkeySignal { id: Action::NextText.id() }, |a| seen = Some(a)));
        assert_eq!(seen, Some(Action::NextText));
    }

    #[test]
    fn test_dispatch_ignores_unknown_ids() {
        let mut router = HotkeyRouter::new(FakeBackend::default(), "test");
        router.register(Action::Show, combo("Ctrl + W"));

        let mut called = false;
        assert!(!router.dispatch(HotkeySignal { id: 99 }, |_| called = true));
        assert!(!router.dispatch(HotkeySignal { id: Action::Hide.id() }, |_| called = true));
        assert!(!called);
    }

    #[test]
    fn test_rejected_registration_is_non_fatal() {
        let backend = FakeBackend {
            reject: vec![Action::Hide.id()],
            ..Default::default()
        };
        let mut router = HotkeyRouter::new(backend, "test");
        assert!(!router.register(Action::Hide, combo("Ctrl + Q")));
        assert!(router.register(Action::Show, combo("Ctrl + W")));
        assert!(!router.is_registered(Action::Hide));

        // A rejected binding never dispatches and is not released on shutdown
        assert!(!router.dispatch(HotkeySignal { id: Action::Hide.id() }, |_| {}));
        router.unregister_all();
        assert_eq!(router.backend().ungrabbed, vec![Action::Show.id()]);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut router = HotkeyRouter::new(FakeBackend::default(), "test");
        router.register(Action::StartTimer, combo("Ctrl + Shift + S"));
        router.unregister(Action::StartTimer);
        router.unregister(Action::StartTimer);
        router.unregister(Action::Quit);
        assert_eq!(router.backend().ungrabbed, vec![Action::StartTimer.id()]);
    }

    #[test]
    fn test_synthesize_presses_in_order_releases_in_reverse() {
        let mut router = HotkeyRouter::new(FakeBackend::default(), "test");
        router.synthesize(&Combination::from_tokens(&["Ctrl", "Shift", "F"]).unwrap()).unwrap();
        let expected: Vec<(String, bool)> = vec![
            ("Ctrl".into(), true),
            ("Shift".into(), true),
            ("F".into(), true),
            ("F".into(), false),
            ("Shift".into(), false),
            ("Ctrl".into(), false),
        ];
        assert_eq!(router.backend().injected, expected);
    }

    #[test]
    fn test_held_modifiers_lifted_around_injection() {
        // Ctrl and Shift still down from the hotkey that triggered the slide change
        let mut backend = FakeBackend {
            held: vec![37, 50],
            ..Default::default()
        };
        synthesize_unmodified(&mut backend, &combo("PageDown")).unwrap();
        let expected: Vec<(String, bool)> = vec![
            ("#37".into(), false),
            ("#50".into(), false),
            ("PageDown".into(), true),
            ("PageDown".into(), false),
            ("#37".into(), true),
            ("#50".into(), true),
        ];
        assert_eq!(backend.injected, expected);
    }

    #[test]
    fn test_nothing_lifted_when_no_modifier_held() {
        let mut backend = FakeBackend::default();
        synthesize_unmodified(&mut backend, &combo("PageUp")).unwrap();
        assert_eq!(backend.injected, vec![("PageUp".to_string(), true), ("PageUp".to_string(), false)]);
    }
}
